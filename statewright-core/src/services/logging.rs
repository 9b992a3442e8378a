//! Logging service

use crate::models::execution::{ErrorInfo, ExecutionStatus};
use crate::models::LogLevel;
use uuid::Uuid;

/// Initialize logging with the specified level.
///
/// `RUST_LOG` takes precedence when set.
pub fn init_logging(level: LogLevel) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let default_filter = match level {
        LogLevel::Error => "statewright=error,statewright_core=error",
        LogLevel::Warn => "statewright=warn,statewright_core=warn",
        LogLevel::Info => "statewright=info,statewright_core=info",
        LogLevel::Debug => "statewright=debug,statewright_core=debug",
        LogLevel::Trace => "statewright=trace,statewright_core=trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()?;

    Ok(())
}

/// Log an execution lifecycle event
pub fn log_execution_event(execution_id: Uuid, status: ExecutionStatus, state: &str) {
    tracing::info!(
        execution_id = %execution_id,
        status = %status,
        state = state,
        "Execution event"
    );
}

/// Log a failure that ended an execution
pub fn log_execution_failure(execution_id: Uuid, error: &ErrorInfo) {
    tracing::warn!(
        execution_id = %execution_id,
        error = %error.error,
        cause = %error.cause,
        "Execution failed"
    );
}
