//! Task executor interface and registry

use crate::models::execution::{error_codes, BranchPath, ErrorInfo};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Everything an executor gets to know about one invocation
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub execution_id: Uuid,
    pub state_name: String,
    pub branch: BranchPath,
    pub resource: String,
    /// Input selected from the working document
    pub payload: Value,
    /// 1-based invocation number of this state entry
    pub attempt: u32,
}

/// Failure reported by an executor.
///
/// `error` is the code retry and catch policies match on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error}: {cause}")]
pub struct TaskError {
    pub error: String,
    pub cause: String,
}

impl TaskError {
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: cause.into(),
        }
    }

    /// Failure with the default `TaskFailed` code
    pub fn failed(cause: impl Into<String>) -> Self {
        Self::new(error_codes::TASK_FAILED, cause)
    }
}

impl From<TaskError> for ErrorInfo {
    fn from(err: TaskError) -> Self {
        ErrorInfo::new(err.error, err.cause)
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::failed(format!("{:#}", err))
    }
}

/// External unit of work a Task state delegates to
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task and return its result
    async fn invoke(&self, input: TaskInput) -> Result<Value, TaskError>;

    /// Accept the task for later completion through the callback API.
    ///
    /// Returning `Ok` only means the work was handed off; the result arrives
    /// when someone resolves `token`.
    async fn invoke_async(&self, input: TaskInput, token: String) -> Result<(), TaskError> {
        let _ = token;
        Err(TaskError::failed(format!(
            "resource '{}' does not support callback tasks",
            input.resource
        )))
    }
}

type SyncHandler = dyn Fn(TaskInput) -> BoxFuture<'static, Result<Value, TaskError>> + Send + Sync;
type CallbackHandler =
    dyn Fn(TaskInput, String) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync;

/// Executor backed by closures, for embedding and tests
pub struct FnExecutor {
    sync: Option<Box<SyncHandler>>,
    callback: Option<Box<CallbackHandler>>,
}

impl FnExecutor {
    /// Executor answering sync invocations
    pub fn sync<F, Fut>(handler: F) -> Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            sync: Some(Box::new(move |input| handler(input).boxed())),
            callback: None,
        }
    }

    /// Executor accepting callback-mode dispatches
    pub fn callback<F, Fut>(handler: F) -> Self
    where
        F: Fn(TaskInput, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            sync: None,
            callback: Some(Box::new(move |input, token| handler(input, token).boxed())),
        }
    }
}

#[async_trait]
impl TaskExecutor for FnExecutor {
    async fn invoke(&self, input: TaskInput) -> Result<Value, TaskError> {
        match &self.sync {
            Some(handler) => handler(input).await,
            None => Err(TaskError::failed(format!(
                "resource '{}' only supports callback tasks",
                input.resource
            ))),
        }
    }

    async fn invoke_async(&self, input: TaskInput, token: String) -> Result<(), TaskError> {
        match &self.callback {
            Some(handler) => handler(input, token).await,
            None => Err(TaskError::failed(format!(
                "resource '{}' does not support callback tasks",
                input.resource
            ))),
        }
    }
}

/// Executors by resource name
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Arc<DashMap<String, Arc<dyn TaskExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one under `name`
    pub fn register(&self, name: impl Into<String>, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(name.into(), executor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(resource: &str, payload: Value) -> TaskInput {
        TaskInput {
            execution_id: Uuid::new_v4(),
            state_name: "Work".to_string(),
            branch: BranchPath::root(),
            resource: resource.to_string(),
            payload,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_fn_executor_sync() {
        let executor = FnExecutor::sync(|input| async move {
            let text = input.payload.as_str().unwrap_or_default().to_uppercase();
            Ok(json!(text))
        });
        let result = executor.invoke(input("upper", json!("Hello World"))).await.unwrap();
        assert_eq!(result, json!("HELLO WORLD"));

        let err = executor
            .invoke_async(input("upper", json!(null)), "tok".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.error, error_codes::TASK_FAILED);
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = ExecutorRegistry::new();
        registry.register("echo", Arc::new(FnExecutor::sync(|i| async move { Ok(i.payload) })));

        assert!(registry.get("missing").is_none());
        let echo = registry.get("echo").unwrap();
        assert_eq!(echo.invoke(input("echo", json!(7))).await.unwrap(), json!(7));
        assert_eq!(registry.names(), vec!["echo".to_string()]);
    }
}
