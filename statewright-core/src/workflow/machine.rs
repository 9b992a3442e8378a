//! Compiled, immutable state machine graph

use crate::expression::{EvalError, Expr, Path, Template};
use crate::models::definition::{TaskMode, MATCH_ALL};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Validated state machine, shared by every execution of its definition
#[derive(Debug, Clone)]
pub struct StateMachine {
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) graph: Arc<Graph>,
    pub(crate) warnings: Vec<String>,
}

impl StateMachine {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Non-fatal findings, e.g. unreachable states
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// States of one scope: the top level or a parallel branch
#[derive(Debug, Clone)]
pub struct Graph {
    pub start_at: String,
    pub states: HashMap<String, State>,
}

impl Graph {
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }
}

#[derive(Debug, Clone)]
pub struct State {
    pub name: String,
    pub kind: StateKind,
}

#[derive(Debug, Clone)]
pub enum StateKind {
    Pass(PassState),
    Wait(WaitState),
    Task(TaskState),
    Choice(ChoiceState),
    Parallel(ParallelState),
    Succeed,
    Fail { error: String, cause: String },
}

/// Where a non-terminal state goes when it completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Next(String),
    /// Branch completes successfully with its document
    End,
}

impl Transition {
    pub fn target(&self) -> Option<&str> {
        match self {
            Transition::Next(name) => Some(name),
            Transition::End => None,
        }
    }
}

/// Destination of a state's result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultPath {
    Discard,
    At(Path),
}

impl ResultPath {
    pub fn apply(&self, document: &mut Value, value: Value) -> Result<(), EvalError> {
        match self {
            ResultPath::Discard => Ok(()),
            ResultPath::At(path) => path.set(document, value),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PassValue {
    /// Current document passes through
    Input,
    Literal(Value),
    Expression(Expr),
    Template(Template),
}

#[derive(Debug, Clone)]
pub struct PassState {
    pub value: PassValue,
    pub result_path: ResultPath,
    pub next: Transition,
}

impl PassState {
    pub fn compute(&self, document: &Value) -> Result<Value, EvalError> {
        match &self.value {
            PassValue::Input => Ok(document.clone()),
            PassValue::Literal(value) => Ok(value.clone()),
            PassValue::Expression(expr) => expr.evaluate(document),
            PassValue::Template(template) => template.render(document),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WaitDuration {
    Seconds(u64),
    Expression(Expr),
}

#[derive(Debug, Clone)]
pub struct WaitState {
    pub duration: WaitDuration,
    pub next: Transition,
}

impl WaitState {
    pub fn compute(&self, document: &Value) -> Result<Duration, EvalError> {
        match &self.duration {
            WaitDuration::Seconds(seconds) => Ok(Duration::from_secs(*seconds)),
            WaitDuration::Expression(expr) => {
                let value = expr.evaluate(document)?;
                let seconds = value
                    .as_f64()
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .ok_or_else(|| {
                        EvalError::TypeMismatch(format!(
                            "wait duration must be a non-negative number, got {}",
                            value
                        ))
                    })?;
                Ok(Duration::from_secs_f64(seconds))
            }
        }
    }
}

/// Input selection shared by task and parallel states
#[derive(Debug, Clone, Default)]
pub struct InputSelector {
    pub input_path: Option<Path>,
    pub parameters: Option<Template>,
}

impl InputSelector {
    pub fn select(&self, document: &Value) -> Result<Value, EvalError> {
        let selected = match &self.input_path {
            Some(path) => path.get(document)?,
            None => document,
        };
        match &self.parameters {
            Some(template) => template.render(selected),
            None => Ok(selected.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskState {
    pub resource: String,
    pub mode: TaskMode,
    pub input: InputSelector,
    pub result_path: ResultPath,
    pub timeout: Option<Duration>,
    pub retry: Vec<Retrier>,
    pub catch: Vec<Catcher>,
    pub next: Transition,
}

#[derive(Debug, Clone)]
pub struct ChoiceRule {
    pub condition: Expr,
    pub next: String,
}

#[derive(Debug, Clone)]
pub struct ChoiceState {
    pub rules: Vec<ChoiceRule>,
    pub default: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParallelState {
    pub branches: Vec<Arc<Graph>>,
    pub input: InputSelector,
    pub result_path: ResultPath,
    pub catch: Vec<Catcher>,
    pub next: Transition,
}

/// List of error codes, `ALL` matching anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMatcher(pub Vec<String>);

impl ErrorMatcher {
    pub fn matches(&self, error: &str) -> bool {
        self.0.iter().any(|code| code == MATCH_ALL || code == error)
    }
}

#[derive(Debug, Clone)]
pub struct Retrier {
    pub matcher: ErrorMatcher,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Option<Duration>,
    pub jitter: bool,
}

#[derive(Debug, Clone)]
pub struct Catcher {
    pub matcher: ErrorMatcher,
    pub next: String,
    pub result_path: ResultPath,
}
