//! Task tokens issued to callback-mode tasks
//!
//! Every token is resolved at most once: whichever of resolve, expire or
//! discard removes it from the pending map first wins, and later calls get
//! [`CallbackError::AlreadyResolved`].

use crate::models::execution::{
    error_codes, BranchPath, CallbackStatus, ErrorInfo, PendingCallback, Resumption,
};
use crate::workflow::persistence::ExecutionStore;
use crate::workflow::timer::Clock;
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result reported for a task token
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    Success(Value),
    Failure(ErrorInfo),
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("unknown task token: {0}")]
    UnknownToken(String),

    #[error("task token already resolved: {0}")]
    AlreadyResolved(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Outstanding callbacks, mirrored in the execution store
pub struct CallbackRegistry {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    pending: DashMap<String, PendingCallback>,
}

impl CallbackRegistry {
    /// Create a registry, reloading callbacks still pending in the store
    pub fn load(store: Arc<dyn ExecutionStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let pending = DashMap::new();
        for callback in store
            .list_pending_callbacks()
            .context("Failed to load pending callbacks")?
        {
            pending.insert(callback.token.clone(), callback);
        }
        Ok(Self {
            store,
            clock,
            pending,
        })
    }

    /// Issue a fresh token for a task and persist it before anyone can see it
    pub fn register(
        &self,
        execution_id: Uuid,
        branch: BranchPath,
        state_name: &str,
        resource: &str,
        input: Value,
        timeout: Duration,
    ) -> Result<PendingCallback> {
        let now = self.clock.now();
        let timeout =
            ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::days(36_500));
        let callback = PendingCallback {
            token: Uuid::new_v4().to_string(),
            execution_id,
            branch,
            state_name: state_name.to_string(),
            resource: resource.to_string(),
            input,
            issued_at: now,
            timeout_at: now.checked_add_signed(timeout).unwrap_or(now),
            dispatched_at: None,
            status: CallbackStatus::Pending,
            resolved_at: None,
            resolution: None,
        };

        self.store
            .put_callback(&callback)
            .context("Failed to persist pending callback")?;
        self.pending
            .insert(callback.token.clone(), callback.clone());

        tracing::debug!(
            token = %callback.token,
            execution_id = %execution_id,
            state = state_name,
            "Registered callback"
        );
        Ok(callback)
    }

    /// Record that the executor accepted the task
    pub fn mark_dispatched(&self, token: &str) -> Result<()> {
        // Resolved while the dispatch was in flight
        let Some(mut entry) = self.pending.get_mut(token) else {
            return Ok(());
        };
        entry.dispatched_at = Some(self.clock.now());
        // Persisted under the entry lock so a concurrent resolve or discard
        // is always written after it
        self.store
            .put_callback(&entry)
            .context("Failed to persist callback dispatch")
    }

    /// Complete a token with the external party's result
    pub fn resolve(
        &self,
        token: &str,
        outcome: &CallbackOutcome,
    ) -> Result<PendingCallback, CallbackError> {
        let (status, resolution) = match outcome {
            CallbackOutcome::Success(output) => (
                CallbackStatus::Succeeded,
                Resumption::TaskSucceeded {
                    output: output.clone(),
                },
            ),
            CallbackOutcome::Failure(error) => (
                CallbackStatus::Failed,
                Resumption::TaskFailed {
                    error: error.clone(),
                },
            ),
        };
        self.finish(token, status, Some(resolution))
    }

    /// Time out a token whose deadline passed
    pub fn expire(&self, token: &str) -> Result<PendingCallback, CallbackError> {
        let error = ErrorInfo::new(
            error_codes::TASK_TIMED_OUT,
            "callback was not completed before its timeout",
        );
        self.finish(
            token,
            CallbackStatus::TimedOut,
            Some(Resumption::TaskFailed { error }),
        )
    }

    /// Abandon a token whose branch no longer waits on it
    pub fn discard(&self, token: &str) -> Result<PendingCallback, CallbackError> {
        self.finish(token, CallbackStatus::Discarded, None)
    }

    fn finish(
        &self,
        token: &str,
        status: CallbackStatus,
        resolution: Option<Resumption>,
    ) -> Result<PendingCallback, CallbackError> {
        let (_, mut callback) = match self.pending.remove(token) {
            Some(entry) => entry,
            None => {
                return match self.store.get_callback(token)? {
                    Some(_) => Err(CallbackError::AlreadyResolved(token.to_string())),
                    None => Err(CallbackError::UnknownToken(token.to_string())),
                }
            }
        };

        let previous = callback.clone();
        callback.status = status;
        callback.resolved_at = Some(self.clock.now());
        callback.resolution = resolution;

        if let Err(e) = self.store.put_callback(&callback) {
            self.pending.insert(token.to_string(), previous);
            return Err(CallbackError::Store(
                e.context("Failed to persist callback resolution"),
            ));
        }

        tracing::debug!(token, status = ?status, "Callback resolved");
        Ok(callback)
    }

    pub fn get(&self, token: &str) -> Option<PendingCallback> {
        self.pending.get(token).map(|entry| entry.clone())
    }

    pub fn is_pending(&self, token: &str) -> bool {
        self.pending.contains_key(token)
    }

    /// Every pending callback
    pub fn pending(&self) -> Vec<PendingCallback> {
        self.pending.iter().map(|entry| entry.clone()).collect()
    }

    pub fn pending_for(&self, execution_id: Uuid) -> Vec<PendingCallback> {
        self.pending
            .iter()
            .filter(|entry| entry.execution_id == execution_id)
            .map(|entry| entry.clone())
            .collect()
    }
}
