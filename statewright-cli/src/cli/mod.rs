//! CLI command handling

pub mod client;
pub mod engine_handlers;
pub mod execution_handlers;
