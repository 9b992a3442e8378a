//! # Statewright Core Library
//!
//! Durable state-machine workflows: definitions are compiled into validated
//! graphs, executions advance through them and survive restarts through the
//! execution store, and callback tasks are completed from outside through
//! task tokens.

pub mod expression;
pub mod models;
pub mod server;
pub mod services;
pub mod workflow;
