//! Rebuild an execution's top-level view from its history alone

use crate::models::execution::{
    ErrorInfo, ExecutionStatus, TransitionKind, TransitionRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("history is empty")]
    Empty,

    #[error("history must begin with a started record, found {0:?}")]
    MissingStart(TransitionKind),

    #[error("record {sequence} belongs to execution {found}, expected {expected}")]
    ForeignRecord {
        sequence: u64,
        expected: Uuid,
        found: Uuid,
    },

    #[error("record {sequence} is out of order after {previous}")]
    OutOfOrder { sequence: u64, previous: u64 },
}

/// Top-level state derived from history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayedExecution {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub current_state: String,
    pub document: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Records applied, branch records included
    pub records: usize,
}

/// Fold an ordered history into the execution's final status and document.
///
/// Only root-branch records move the top-level cursor; branch records are
/// checked for ordering and otherwise skipped.
pub fn replay(history: &[TransitionRecord]) -> Result<ReplayedExecution, ReplayError> {
    let first = history.first().ok_or(ReplayError::Empty)?;
    if first.kind != TransitionKind::Started || !first.branch.is_root() {
        return Err(ReplayError::MissingStart(first.kind));
    }

    let mut replayed = ReplayedExecution {
        execution_id: first.execution_id,
        status: ExecutionStatus::Running,
        current_state: first.to_state.clone().unwrap_or_default(),
        document: first.document.clone(),
        error: None,
        records: 0,
    };
    let mut previous: Option<u64> = None;

    for record in history {
        if record.execution_id != replayed.execution_id {
            return Err(ReplayError::ForeignRecord {
                sequence: record.sequence,
                expected: replayed.execution_id,
                found: record.execution_id,
            });
        }
        if let Some(previous) = previous {
            if record.sequence <= previous {
                return Err(ReplayError::OutOfOrder {
                    sequence: record.sequence,
                    previous,
                });
            }
        }
        previous = Some(record.sequence);
        replayed.records += 1;

        if !record.branch.is_root() {
            continue;
        }

        replayed.document = record.document.clone();
        match record.kind {
            TransitionKind::Started
            | TransitionKind::Transition
            | TransitionKind::Caught => {
                if let Some(to) = &record.to_state {
                    replayed.current_state = to.clone();
                }
                replayed.status = ExecutionStatus::Running;
            }
            TransitionKind::Retry | TransitionKind::Resumed | TransitionKind::Joined => {
                replayed.status = ExecutionStatus::Running;
            }
            TransitionKind::Suspended | TransitionKind::Forked => {
                replayed.status = ExecutionStatus::Suspended;
            }
            TransitionKind::Succeeded => replayed.status = ExecutionStatus::Succeeded,
            TransitionKind::Failed => {
                replayed.status = ExecutionStatus::Failed;
                replayed.error = record.error.clone();
            }
            TransitionKind::Cancelled => {}
        }
    }

    Ok(replayed)
}
