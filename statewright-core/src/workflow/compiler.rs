//! Validating compiler from raw definitions to an immutable graph

use crate::expression::{EvalError, Expr, Path, Template};
use crate::models::definition::{
    BranchDefinition, CatchDefinition, RetryDefinition, StateDefinition, StateMachineDefinition,
};
use crate::workflow::machine::{
    Catcher, ChoiceRule, ChoiceState, ErrorMatcher, Graph, InputSelector, ParallelState,
    PassState, PassValue, ResultPath, Retrier, State, StateKind, StateMachine, TaskState,
    Transition, WaitDuration, WaitState,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const DEFAULT_CATCH_RESULT_PATH: &str = "$.error";

/// Reasons a definition is rejected
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("state machine name cannot be empty")]
    EmptyName,

    #[error("start state '{0}' is not defined")]
    MissingStart(String),

    #[error("state '{0}' is defined more than once")]
    DuplicateState(String),

    #[error("state '{state}' refers to undefined state '{target}'")]
    UnknownState { state: String, target: String },

    #[error("state '{0}' must declare either `next` or `end: true`")]
    MissingTransition(String),

    #[error("parallel state '{0}' has no branches")]
    EmptyParallel(String),

    #[error("branch {index} of parallel state '{state}': {source}")]
    Branch {
        state: String,
        index: usize,
        source: Box<CompileError>,
    },

    #[error("state '{state}' has an invalid {field}: {source}")]
    InvalidExpression {
        state: String,
        field: &'static str,
        source: EvalError,
    },

    #[error("state '{state}': {reason}")]
    InvalidState { state: String, reason: String },

    #[error("state '{state}' has an invalid retry policy: {reason}")]
    InvalidRetryPolicy { state: String, reason: String },

    #[error("unconditional loop: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Compile and validate a definition.
///
/// Unreachable states do not fail compilation; they are logged and kept in
/// [`StateMachine::warnings`].
pub fn compile(definition: &StateMachineDefinition) -> Result<StateMachine, CompileError> {
    if definition.name.trim().is_empty() {
        return Err(CompileError::EmptyName);
    }

    let mut warnings = Vec::new();
    let graph = compile_graph(&definition.start_at, &definition.states, "", &mut warnings)?;

    for warning in &warnings {
        warn!(state_machine = %definition.name, "{}", warning);
    }

    Ok(StateMachine {
        name: definition.name.clone(),
        description: definition.description.clone(),
        graph: Arc::new(graph),
        warnings,
    })
}

fn compile_graph(
    start_at: &str,
    definitions: &[StateDefinition],
    scope: &str,
    warnings: &mut Vec<String>,
) -> Result<Graph, CompileError> {
    let mut known = HashSet::new();
    for definition in definitions {
        if !known.insert(definition.name()) {
            return Err(CompileError::DuplicateState(definition.name().to_string()));
        }
    }
    if !known.contains(start_at) {
        return Err(CompileError::MissingStart(start_at.to_string()));
    }

    let mut states = HashMap::with_capacity(definitions.len());
    let mut order = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let state = compile_state(definition, &known, scope, warnings)?;
        order.push(state.name.clone());
        states.insert(state.name.clone(), state);
    }

    if let Some(path) = find_unconditional_cycle(&states, &order) {
        return Err(CompileError::Cycle { path });
    }

    for name in find_unreachable_states(start_at, &states, &order) {
        warnings.push(format!(
            "{}State '{}' is unreachable from start state '{}'",
            scope, name, start_at
        ));
    }

    Ok(Graph {
        start_at: start_at.to_string(),
        states,
    })
}

fn compile_state(
    definition: &StateDefinition,
    known: &HashSet<&str>,
    scope: &str,
    warnings: &mut Vec<String>,
) -> Result<State, CompileError> {
    let name = definition.name();
    let kind = match definition {
        StateDefinition::Pass(pass) => {
            let sources = [
                pass.result.is_some(),
                pass.expression.is_some(),
                pass.parameters.is_some(),
            ];
            if sources.iter().filter(|set| **set).count() > 1 {
                return Err(invalid(
                    name,
                    "only one of `result`, `expression` or `parameters` may be set",
                ));
            }
            let value = if let Some(result) = &pass.result {
                PassValue::Literal(result.clone())
            } else if let Some(source) = &pass.expression {
                PassValue::Expression(expression(name, "expression", source)?)
            } else if let Some(parameters) = &pass.parameters {
                PassValue::Template(template(name, parameters)?)
            } else {
                PassValue::Input
            };
            StateKind::Pass(PassState {
                value,
                result_path: result_path(name, pass.result_path.as_deref(), "$")?,
                next: transition(name, pass.next.as_deref(), pass.end, known)?,
            })
        }
        StateDefinition::Wait(wait) => {
            let duration = match (&wait.seconds, &wait.seconds_expression) {
                (Some(seconds), None) => WaitDuration::Seconds(*seconds),
                (None, Some(source)) => {
                    WaitDuration::Expression(expression(name, "seconds_expression", source)?)
                }
                _ => {
                    return Err(invalid(
                        name,
                        "exactly one of `seconds` or `seconds_expression` must be set",
                    ))
                }
            };
            StateKind::Wait(WaitState {
                duration,
                next: transition(name, wait.next.as_deref(), wait.end, known)?,
            })
        }
        StateDefinition::Task(task) => {
            if task.resource.trim().is_empty() {
                return Err(invalid(name, "`resource` cannot be empty"));
            }
            if task.timeout_seconds == Some(0) {
                return Err(invalid(name, "`timeout_seconds` must be at least 1"));
            }
            let result_path = if task.discard_result {
                if task.result_path.is_some() {
                    return Err(invalid(
                        name,
                        "`discard_result` and `result_path` are mutually exclusive",
                    ));
                }
                ResultPath::Discard
            } else {
                result_path(name, task.result_path.as_deref(), "$")?
            };
            StateKind::Task(TaskState {
                resource: task.resource.clone(),
                mode: task.mode,
                input: input_selector(name, task.input_path.as_deref(), task.parameters.as_ref())?,
                result_path,
                timeout: task.timeout_seconds.map(Duration::from_secs),
                retry: task
                    .retry
                    .iter()
                    .map(|policy| retrier(name, policy))
                    .collect::<Result<_, _>>()?,
                catch: catchers(name, &task.catch, known)?,
                next: transition(name, task.next.as_deref(), task.end, known)?,
            })
        }
        StateDefinition::Choice(choice) => {
            if choice.choices.is_empty() && choice.default.is_none() {
                return Err(invalid(name, "choice state needs at least one rule or a default"));
            }
            let mut rules = Vec::with_capacity(choice.choices.len());
            for rule in &choice.choices {
                ensure_known(name, &rule.next, known)?;
                rules.push(ChoiceRule {
                    condition: expression(name, "condition", &rule.condition)?,
                    next: rule.next.clone(),
                });
            }
            if let Some(default) = &choice.default {
                ensure_known(name, default, known)?;
            }
            StateKind::Choice(ChoiceState {
                rules,
                default: choice.default.clone(),
            })
        }
        StateDefinition::Parallel(parallel) => {
            if parallel.branches.is_empty() {
                return Err(CompileError::EmptyParallel(name.to_string()));
            }
            let branches = parallel
                .branches
                .iter()
                .enumerate()
                .map(|(index, branch)| compile_branch(name, index, branch, scope, warnings))
                .collect::<Result<Vec<_>, _>>()?;
            StateKind::Parallel(ParallelState {
                branches,
                input: input_selector(name, parallel.input_path.as_deref(), None)?,
                result_path: result_path(name, parallel.result_path.as_deref(), "$")?,
                catch: catchers(name, &parallel.catch, known)?,
                next: transition(name, parallel.next.as_deref(), parallel.end, known)?,
            })
        }
        StateDefinition::Succeed(_) => StateKind::Succeed,
        StateDefinition::Fail(fail) => {
            if fail.error.trim().is_empty() {
                return Err(invalid(name, "`error` cannot be empty"));
            }
            StateKind::Fail {
                error: fail.error.clone(),
                cause: fail.cause.clone().unwrap_or_default(),
            }
        }
    };

    Ok(State {
        name: name.to_string(),
        kind,
    })
}

fn compile_branch(
    state: &str,
    index: usize,
    branch: &BranchDefinition,
    scope: &str,
    warnings: &mut Vec<String>,
) -> Result<Arc<Graph>, CompileError> {
    let branch_scope = format!("{}{}[{}]: ", scope, state, index);
    compile_graph(&branch.start_at, &branch.states, &branch_scope, warnings)
        .map(Arc::new)
        .map_err(|source| CompileError::Branch {
            state: state.to_string(),
            index,
            source: Box::new(source),
        })
}

fn invalid(state: &str, reason: &str) -> CompileError {
    CompileError::InvalidState {
        state: state.to_string(),
        reason: reason.to_string(),
    }
}

fn ensure_known(state: &str, target: &str, known: &HashSet<&str>) -> Result<(), CompileError> {
    if known.contains(target) {
        Ok(())
    } else {
        Err(CompileError::UnknownState {
            state: state.to_string(),
            target: target.to_string(),
        })
    }
}

fn transition(
    state: &str,
    next: Option<&str>,
    end: bool,
    known: &HashSet<&str>,
) -> Result<Transition, CompileError> {
    match (next, end) {
        (Some(_), true) => Err(invalid(state, "`next` and `end` are mutually exclusive")),
        (Some(target), false) => {
            ensure_known(state, target, known)?;
            Ok(Transition::Next(target.to_string()))
        }
        (None, true) => Ok(Transition::End),
        (None, false) => Err(CompileError::MissingTransition(state.to_string())),
    }
}

fn path(state: &str, field: &'static str, source: &str) -> Result<Path, CompileError> {
    Path::parse(source).map_err(|source| CompileError::InvalidExpression {
        state: state.to_string(),
        field,
        source,
    })
}

fn expression(state: &str, field: &'static str, source: &str) -> Result<Expr, CompileError> {
    Expr::parse(source).map_err(|source| CompileError::InvalidExpression {
        state: state.to_string(),
        field,
        source,
    })
}

fn template(state: &str, value: &serde_json::Value) -> Result<Template, CompileError> {
    Template::compile(value).map_err(|source| CompileError::InvalidExpression {
        state: state.to_string(),
        field: "parameters",
        source,
    })
}

fn result_path(
    state: &str,
    declared: Option<&str>,
    default: &str,
) -> Result<ResultPath, CompileError> {
    path(state, "result_path", declared.unwrap_or(default)).map(ResultPath::At)
}

fn input_selector(
    state: &str,
    input_path: Option<&str>,
    parameters: Option<&serde_json::Value>,
) -> Result<InputSelector, CompileError> {
    Ok(InputSelector {
        input_path: input_path
            .map(|source| path(state, "input_path", source))
            .transpose()?,
        parameters: parameters.map(|value| template(state, value)).transpose()?,
    })
}

fn retrier(state: &str, policy: &RetryDefinition) -> Result<Retrier, CompileError> {
    let fail = |reason: String| CompileError::InvalidRetryPolicy {
        state: state.to_string(),
        reason,
    };

    if policy.errors.is_empty() {
        return Err(fail("errors cannot be empty".to_string()));
    }
    if policy.max_attempts < 1 {
        return Err(fail("max_attempts must be at least 1".to_string()));
    }
    if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
        return Err(fail(format!(
            "backoff_multiplier must be at least 1.0, got {}",
            policy.backoff_multiplier
        )));
    }
    let backoff_base = Duration::try_from_secs_f64(policy.backoff_base_seconds)
        .map_err(|_| fail("backoff_base_seconds must be a non-negative number".to_string()))?;
    let max_backoff = policy
        .max_backoff_seconds
        .map(Duration::try_from_secs_f64)
        .transpose()
        .map_err(|_| fail("max_backoff_seconds must be a non-negative number".to_string()))?;

    Ok(Retrier {
        matcher: ErrorMatcher(policy.errors.clone()),
        max_attempts: policy.max_attempts,
        backoff_base,
        backoff_multiplier: policy.backoff_multiplier,
        max_backoff,
        jitter: policy.jitter,
    })
}

fn catchers(
    state: &str,
    definitions: &[CatchDefinition],
    known: &HashSet<&str>,
) -> Result<Vec<Catcher>, CompileError> {
    definitions
        .iter()
        .map(|catch| {
            if catch.errors.is_empty() {
                return Err(invalid(state, "catch entry must list at least one error"));
            }
            ensure_known(state, &catch.next, known)?;
            Ok(Catcher {
                matcher: ErrorMatcher(catch.errors.clone()),
                next: catch.next.clone(),
                result_path: result_path(
                    state,
                    catch.result_path.as_deref(),
                    DEFAULT_CATCH_RESULT_PATH,
                )?,
            })
        })
        .collect()
}

/// Every state a state can move to, in any outcome
pub(crate) fn successors(state: &State) -> Vec<&str> {
    let mut targets = Vec::new();
    match &state.kind {
        StateKind::Pass(pass) => targets.extend(pass.next.target()),
        StateKind::Wait(wait) => targets.extend(wait.next.target()),
        StateKind::Task(task) => {
            targets.extend(task.next.target());
            targets.extend(task.catch.iter().map(|c| c.next.as_str()));
        }
        StateKind::Choice(choice) => {
            targets.extend(choice.rules.iter().map(|r| r.next.as_str()));
            targets.extend(choice.default.as_deref());
        }
        StateKind::Parallel(parallel) => {
            targets.extend(parallel.next.target());
            targets.extend(parallel.catch.iter().map(|c| c.next.as_str()));
        }
        StateKind::Succeed | StateKind::Fail { .. } => {}
    }
    targets
}

/// Pass and Wait states always take their `next`, as does a Choice with no
/// rules; a loop made only of them never terminates
fn unconditional_next(state: &State) -> Option<&str> {
    match &state.kind {
        StateKind::Pass(pass) => pass.next.target(),
        StateKind::Wait(wait) => wait.next.target(),
        StateKind::Choice(choice) if choice.rules.is_empty() => choice.default.as_deref(),
        _ => None,
    }
}

fn find_unconditional_cycle(
    states: &HashMap<String, State>,
    order: &[String],
) -> Option<Vec<String>> {
    let mut cleared: HashSet<&str> = HashSet::new();

    for start in order {
        let mut walk: Vec<&str> = Vec::new();
        let mut current = start.as_str();
        loop {
            if cleared.contains(current) {
                break;
            }
            if let Some(pos) = walk.iter().position(|name| *name == current) {
                let mut cycle: Vec<String> = walk[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(current.to_string());
                return Some(cycle);
            }
            let next = match states.get(current).and_then(unconditional_next) {
                Some(next) => next,
                None => break,
            };
            walk.push(current);
            current = next;
        }
        cleared.extend(walk);
    }

    None
}

fn find_unreachable_states(
    start_at: &str,
    states: &HashMap<String, State>,
    order: &[String],
) -> Vec<String> {
    let mut reachable = HashSet::new();
    let mut queue = VecDeque::new();
    reachable.insert(start_at);
    queue.push_back(start_at);

    while let Some(name) = queue.pop_front() {
        if let Some(state) = states.get(name) {
            for target in successors(state) {
                if reachable.insert(target) {
                    queue.push_back(target);
                }
            }
        }
    }

    order
        .iter()
        .filter(|name| !reachable.contains(name.as_str()))
        .cloned()
        .collect()
}
