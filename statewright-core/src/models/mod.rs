//! Data models for statewright

pub mod configuration;
pub mod definition;
pub mod execution;

pub use configuration::*;
pub use definition::*;
pub use execution::*;
