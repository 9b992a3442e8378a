//! Runtime execution data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Error codes produced by the engine itself
pub mod error_codes {
    /// Default code of an executor failure
    pub const TASK_FAILED: &str = "TaskFailed";
    /// Sync task exceeded its timeout or a callback was not completed in time
    pub const TASK_TIMED_OUT: &str = "TaskTimedOut";
    /// No choice rule matched and no default was declared
    pub const NO_MATCHING_CHOICE: &str = "NoMatchingChoice";
    /// A path or expression could not be evaluated
    pub const EVAL_ERROR: &str = "EvalError";
    /// A parallel branch task died without reporting an outcome
    pub const BRANCH_FAILED: &str = "BranchFailed";
    /// An operator stopped the execution
    pub const EXECUTION_STOPPED: &str = "ExecutionStopped";
    /// Too many steps were taken without waiting
    pub const TRANSITION_LIMIT_EXCEEDED: &str = "TransitionLimitExceeded";
}

/// Execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Actively advancing
    Running,
    /// Waiting on a timer, a task token or a join barrier
    Suspended,
    /// Reached a terminal success
    Succeeded,
    /// Failed without recovery
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Succeeded | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Suspended => "suspended",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Error payload carried through retry, catch and failure records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code matched by retry and catch policies
    pub error: String,
    /// Human-readable cause
    pub cause: String,
}

impl ErrorInfo {
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: cause.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error, self.cause)
    }
}

/// Address of a branch inside an execution: indices of the parallel branches
/// taken from the root
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchPath(Vec<usize>);

impl BranchPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    /// True for `ancestor` itself and every branch below it
    pub fn is_within(&self, ancestor: &BranchPath) -> bool {
        self.0.starts_with(&ancestor.0)
    }
}

impl fmt::Display for BranchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("root");
        }
        let parts: Vec<String> = self.0.iter().map(|i| i.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

/// Why a timer was armed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimerReason {
    Wait,
    RetryBackoff,
}

/// What a suspended branch is waiting for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suspension {
    Timer {
        resume_at: DateTime<Utc>,
        reason: TimerReason,
    },
    Callback {
        token: String,
        timeout_at: DateTime<Utc>,
    },
    /// Parallel state waiting for its branches
    Join,
}

/// Wake-up delivered to a suspended branch, consumed by its next step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resumption {
    TimerFired,
    TaskSucceeded { output: Value },
    TaskFailed { error: ErrorInfo },
}

/// Terminal outcome of a branch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchOutcome {
    Succeeded { output: Value },
    Failed { error: ErrorInfo },
    /// Stopped because a sibling failed
    Cancelled,
}

/// Cursor plus private working document of one branch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchState {
    pub path: BranchPath,
    /// State the cursor is on
    pub current_state: String,
    /// Working document owned by this branch
    pub document: Value,
    /// Invocations of the current state since it was entered
    #[serde(default)]
    pub attempts: u32,
    pub entered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<Suspension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumption: Option<Resumption>,
    /// Join group of the parallel state the cursor is on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<BranchOutcome>,
}

impl BranchState {
    pub fn new(
        path: BranchPath,
        current_state: impl Into<String>,
        document: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            path,
            current_state: current_state.into(),
            document,
            attempts: 0,
            entered_at: now,
            suspension: None,
            resumption: None,
            branches: Vec::new(),
            outcome: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Whether the next drive has work to do on this branch or below it
    pub fn is_runnable(&self) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        match &self.suspension {
            None => true,
            Some(Suspension::Join) => self.branches.iter().any(BranchState::is_runnable),
            Some(_) => self.resumption.is_some(),
        }
    }

    /// Find a branch by absolute path
    pub fn find(&self, path: &BranchPath) -> Option<&BranchState> {
        let mut current = self;
        for index in path.indices().iter().skip(self.path.indices().len()) {
            current = current.branches.get(*index)?;
        }
        Some(current)
    }

    pub fn find_mut(&mut self, path: &BranchPath) -> Option<&mut BranchState> {
        let depth = self.path.indices().len();
        let mut current = self;
        for index in path.indices().iter().skip(depth) {
            current = current.branches.get_mut(*index)?;
        }
        Some(current)
    }

    /// Tokens of every callback this branch or its descendants are waiting on
    pub fn pending_tokens(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        self.collect_tokens(&mut tokens);
        tokens
    }

    fn collect_tokens(&self, tokens: &mut Vec<String>) {
        if self.outcome.is_some() {
            return;
        }
        if let Some(Suspension::Callback { token, .. }) = &self.suspension {
            tokens.push(token.clone());
        }
        for branch in &self.branches {
            branch.collect_tokens(tokens);
        }
    }

    /// Armed timers in this subtree as (branch, due time)
    pub fn pending_timers(&self) -> Vec<(BranchPath, DateTime<Utc>)> {
        let mut timers = Vec::new();
        self.collect_timers(&mut timers);
        timers
    }

    fn collect_timers(&self, timers: &mut Vec<(BranchPath, DateTime<Utc>)>) {
        if self.outcome.is_some() {
            return;
        }
        if let Some(Suspension::Timer { resume_at, .. }) = &self.suspension {
            if self.resumption.is_none() {
                timers.push((self.path.clone(), *resume_at));
            }
        }
        for branch in &self.branches {
            branch.collect_timers(timers);
        }
    }
}

/// One run of a definition against an input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: Uuid,
    /// Definition this execution instantiates
    pub definition_id: String,
    pub status: ExecutionStatus,
    /// Input document the execution was started with
    pub input: Value,
    /// Top-level cursor; parallel branches hang below it
    pub root: BranchState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn current_state(&self) -> &str {
        &self.root.current_state
    }

    pub fn document(&self) -> &Value {
        &self.root.document
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Kind of history record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Branch or execution entered its start state
    Started,
    /// Normal move to the next state
    Transition,
    /// State invoked again after a failure
    Retry,
    /// Failure routed to a catch target
    Caught,
    /// Branch parked on a timer, token or join barrier
    Suspended,
    /// Branch woken up
    Resumed,
    /// Parallel state forked its branches
    Forked,
    /// Parallel state collected its branches
    Joined,
    Succeeded,
    Failed,
    Cancelled,
}

/// State transition record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRecord {
    /// Position in the execution history, assigned by the store
    #[serde(default)]
    pub sequence: u64,
    pub execution_id: Uuid,
    pub branch: BranchPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state: Option<String>,
    pub kind: TransitionKind,
    pub timestamp: DateTime<Utc>,
    /// Branch document after the transition
    pub document: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

/// Lifecycle of a task token
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
    /// Abandoned because the owning branch was cancelled or the execution stopped
    Discarded,
}

/// Outstanding asynchronous task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingCallback {
    pub token: String,
    pub execution_id: Uuid,
    pub branch: BranchPath,
    pub state_name: String,
    /// Executor the task was dispatched to
    pub resource: String,
    /// Input handed to the executor
    pub input: Value,
    pub issued_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    /// Set once the executor accepted the dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    pub status: CallbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Wake-up owed to the branch once resolved, kept until the branch consumes it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resumption>,
}
