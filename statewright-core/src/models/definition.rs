//! Declarative state machine definitions, as authored in JSON or YAML
//!
//! These types are the raw, unvalidated form. `workflow::compiler::compile`
//! turns them into an immutable `StateMachine`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Error matcher entry matching every error code
pub const MATCH_ALL: &str = "ALL";

/// State machine definition - reusable template for executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineDefinition {
    /// Unique definition identifier
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the starting state
    pub start_at: String,
    /// States in declaration order
    pub states: Vec<StateDefinition>,
}

/// Sub-graph run by one branch of a parallel state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchDefinition {
    pub start_at: String,
    pub states: Vec<StateDefinition>,
}

/// One state, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateDefinition {
    Pass(PassDefinition),
    Wait(WaitDefinition),
    Task(TaskDefinition),
    Choice(ChoiceDefinition),
    Parallel(ParallelDefinition),
    Succeed(SucceedDefinition),
    Fail(FailDefinition),
}

impl StateDefinition {
    pub fn name(&self) -> &str {
        match self {
            StateDefinition::Pass(s) => &s.name,
            StateDefinition::Wait(s) => &s.name,
            StateDefinition::Task(s) => &s.name,
            StateDefinition::Choice(s) => &s.name,
            StateDefinition::Parallel(s) => &s.name,
            StateDefinition::Succeed(s) => &s.name,
            StateDefinition::Fail(s) => &s.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StateDefinition::Pass(_) => "pass",
            StateDefinition::Wait(_) => "wait",
            StateDefinition::Task(_) => "task",
            StateDefinition::Choice(_) => "choice",
            StateDefinition::Parallel(_) => "parallel",
            StateDefinition::Succeed(_) => "succeed",
            StateDefinition::Fail(_) => "fail",
        }
    }
}

/// Writes a literal or derived value into the document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassDefinition {
    pub name: String,
    /// Literal value to write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Expression whose value is written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Template rendered against the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    /// Where the value goes (default `$`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
}

/// Suspends the branch for a fixed or derived number of seconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
}

/// How a task hands work to its executor
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Invoke and wait for the result
    #[default]
    #[serde(alias = "request_response", alias = "run_job")]
    Sync,
    /// Dispatch with a task token; an external party completes it later
    #[serde(alias = "wait_for_task_token")]
    Callback,
}

/// Delegates work to a registered executor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    /// Name of the executor in the registry
    pub resource: String,
    #[serde(default)]
    pub mode: TaskMode,
    /// Selects the part of the document handed to the executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<String>,
    /// Template rendered against the selected input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    /// Where the result goes (default `$`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    /// Drop the result and keep the document unchanged
    #[serde(default)]
    pub discard_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<RetryDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<CatchDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
}

/// Ordered conditional branching
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChoiceDefinition {
    pub name: String,
    pub choices: Vec<ChoiceRuleDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceRuleDefinition {
    /// Boolean expression, e.g. `$.count == 0`
    pub condition: String,
    pub next: String,
}

/// Runs branches concurrently and joins their outputs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelDefinition {
    pub name: String,
    pub branches: Vec<BranchDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<CatchDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SucceedDefinition {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailDefinition {
    pub name: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Retry policy entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDefinition {
    /// Error codes this entry applies to
    #[serde(default = "default_matchers")]
    pub errors: Vec<String>,
    /// Total invocations allowed, first attempt included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in seconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: f64,
    /// Growth factor applied per further retry
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_seconds: Option<f64>,
    /// Randomize each delay between zero and its computed value
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryDefinition {
    fn default() -> Self {
        Self {
            errors: default_matchers(),
            max_attempts: default_max_attempts(),
            backoff_base_seconds: default_backoff_base(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_seconds: None,
            jitter: false,
        }
    }
}

/// Catch policy entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchDefinition {
    #[serde(default = "default_matchers")]
    pub errors: Vec<String>,
    pub next: String,
    /// Where the error payload goes (default `$.error`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
}

fn default_matchers() -> Vec<String> {
    vec![MATCH_ALL.to_string()]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl StateMachineDefinition {
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse state machine JSON")
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse state machine YAML")
    }

    /// Load a definition file; `.json` is parsed as JSON, anything else as YAML
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read definition file {}", path.display()))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }
}
