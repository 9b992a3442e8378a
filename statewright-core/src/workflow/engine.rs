//! State machine interpreter
//!
//! [`Engine::drive`] advances an execution's branch tree as far as it can go
//! without waiting: it returns once every branch has either finished or
//! parked on a timer, a task token or a join barrier. The engine never talks
//! to the store itself. At every step boundary a branch publishes its state
//! and hands what it produced (history records, timers, callback dispatches)
//! to a [`ProgressSink`], which the orchestrator implements by committing
//! under the execution lock. Whatever is left when the drive returns comes
//! back in the [`DriveReport`].

use crate::expression::EvalError;
use crate::models::configuration::Configuration;
use crate::models::definition::TaskMode;
use crate::models::execution::{
    error_codes, BranchOutcome, BranchPath, BranchState, ErrorInfo, Resumption, Suspension,
    TimerReason, TransitionKind, TransitionRecord,
};
use crate::workflow::callback_registry::{CallbackError, CallbackRegistry};
use crate::workflow::executor::{ExecutorRegistry, TaskInput};
use crate::workflow::machine::{
    Catcher, ChoiceState, Graph, ParallelState, PassState, Retrier, StateKind, TaskState,
    Transition, WaitState,
};
use crate::workflow::retry::{decide, FailureAction};
use crate::workflow::timer::{Clock, TimerAction, TimerEntry};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Applied to callback tasks without their own timeout
    pub default_callback_timeout: Duration,
    /// Upper bound for any retry delay
    pub max_backoff: Option<Duration>,
    /// Steps one drive may take, across all branches, before the stepping
    /// branch fails with `TransitionLimitExceeded`
    pub max_transitions: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_callback_timeout: Duration::from_secs(86_400),
            max_backoff: Some(Duration::from_secs(600)),
            max_transitions: 10_000,
        }
    }
}

impl From<&Configuration> for EngineSettings {
    fn from(config: &Configuration) -> Self {
        Self {
            default_callback_timeout: Duration::from_secs(config.default_callback_timeout_seconds),
            max_backoff: Some(Duration::from_secs(config.max_backoff_seconds)),
            max_transitions: config.max_transitions_per_drive,
        }
    }
}

/// Callback task to hand to its executor once the suspension is committed
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub token: String,
    pub input: TaskInput,
}

/// Branch tree plus what was produced since the last report
#[derive(Debug, Clone)]
pub struct DriveReport {
    pub root: BranchState,
    /// History records in the order they happened (sequence not yet assigned)
    pub records: Vec<TransitionRecord>,
    pub dispatches: Vec<Dispatch>,
    pub timers: Vec<TimerEntry>,
    /// Tokens discarded because their branch was cancelled
    pub discarded: Vec<String>,
}

/// Receives progress from a drive that is still running
///
/// Calls are serialized. `root` is the whole tree as last published by each
/// branch; the records belong to branches whose published state already
/// reflects them.
pub trait ProgressSink: Send + Sync {
    /// Persist the report, then arm its timers and hand out its dispatches
    fn checkpoint(&self, progress: DriveReport) -> Result<()>;
}

/// Interpreter services shared by all executions
#[derive(Clone)]
pub struct Engine {
    executors: ExecutorRegistry,
    callbacks: Arc<CallbackRegistry>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        executors: ExecutorRegistry,
        callbacks: Arc<CallbackRegistry>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            executors,
            callbacks,
            clock,
            settings,
        }
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Advance `root` until nothing more can happen without an external event.
    ///
    /// Setting `stop` makes every branch cancel itself at its next step.
    /// Without a sink everything the drive produced comes back in the report.
    pub async fn drive(
        &self,
        execution_id: Uuid,
        graph: Arc<Graph>,
        root: BranchState,
        stop: Arc<AtomicBool>,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Result<DriveReport> {
        let ctx = Arc::new(DriveContext::new(self.clone(), execution_id, &root, sink));

        let root = run_branch(ctx.clone(), graph, root, CancelScope::root(stop)).await?;
        let journal = std::mem::take(&mut *ctx.journal());
        Ok(journal.into_report(root))
    }

    /// Cancel every unfinished branch in `branch`'s subtree, discarding the
    /// task tokens they wait on. Returns the records describing it.
    pub fn cancel(&self, execution_id: Uuid, branch: &mut BranchState) -> Vec<TransitionRecord> {
        let ctx = DriveContext::new(self.clone(), execution_id, branch, None);
        ctx.cancel_branch(branch);
        let journal = std::mem::take(&mut *ctx.journal());
        journal.records
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Cursor moved; keep stepping
    Continue,
    /// Branch finished or parked
    Stop,
}

/// Output not yet handed to the sink; timers and discards are tagged with
/// the branch that produced them
#[derive(Debug, Default)]
struct Journal {
    records: Vec<TransitionRecord>,
    dispatches: Vec<Dispatch>,
    timers: Vec<(BranchPath, TimerEntry)>,
    discarded: Vec<(BranchPath, String)>,
}

fn split_off<T>(items: &mut Vec<T>, within: impl Fn(&T) -> bool) -> Vec<T> {
    let (taken, kept): (Vec<T>, Vec<T>) = std::mem::take(items).into_iter().partition(within);
    *items = kept;
    taken
}

impl Journal {
    /// Remove the entries produced by `path` and the branches below it
    fn take_within(&mut self, path: &BranchPath) -> Journal {
        Journal {
            records: split_off(&mut self.records, |record: &TransitionRecord| {
                record.branch.is_within(path)
            }),
            dispatches: split_off(&mut self.dispatches, |dispatch: &Dispatch| {
                dispatch.input.branch.is_within(path)
            }),
            timers: split_off(&mut self.timers, |(branch, _): &(BranchPath, TimerEntry)| {
                branch.is_within(path)
            }),
            discarded: split_off(&mut self.discarded, |(branch, _): &(BranchPath, String)| {
                branch.is_within(path)
            }),
        }
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
            && self.dispatches.is_empty()
            && self.timers.is_empty()
            && self.discarded.is_empty()
    }

    fn into_report(self, root: BranchState) -> DriveReport {
        DriveReport {
            root,
            records: self.records,
            dispatches: self.dispatches,
            timers: self.timers.into_iter().map(|(_, timer)| timer).collect(),
            discarded: self.discarded.into_iter().map(|(_, token)| token).collect(),
        }
    }
}

/// Cancellation flags visible to a branch: the execution stop flag plus
/// the join group flag of every enclosing parallel state
#[derive(Clone)]
struct CancelScope {
    inherited: Vec<Arc<AtomicBool>>,
    group: Option<Arc<AtomicBool>>,
}

impl CancelScope {
    fn root(stop: Arc<AtomicBool>) -> Self {
        Self {
            inherited: vec![stop],
            group: None,
        }
    }

    /// Scope for the branches of a new join group
    fn fork(&self) -> Self {
        let mut inherited = self.inherited.clone();
        inherited.extend(self.group.clone());
        Self {
            inherited,
            group: Some(Arc::new(AtomicBool::new(false))),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.inherited
            .iter()
            .chain(self.group.iter())
            .any(|flag| flag.load(Ordering::SeqCst))
    }

    /// Ask the siblings of this branch to stop
    fn cancel_group(&self) {
        if let Some(group) = &self.group {
            group.store(true, Ordering::SeqCst);
        }
    }
}

struct DriveContext {
    engine: Engine,
    execution_id: Uuid,
    journal: Mutex<Journal>,
    /// Every branch as it last published itself
    tree: Mutex<BranchState>,
    sink: Option<Arc<dyn ProgressSink>>,
    steps: AtomicU64,
}

fn eval_error(err: &EvalError) -> ErrorInfo {
    ErrorInfo::new(error_codes::EVAL_ERROR, err.to_string())
}

fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

fn run_branch(
    ctx: Arc<DriveContext>,
    graph: Arc<Graph>,
    mut branch: BranchState,
    scope: CancelScope,
) -> BoxFuture<'static, Result<BranchState>> {
    async move {
        while branch.outcome.is_none() {
            ctx.checkpoint(&branch)?;
            tokio::task::yield_now().await;

            if scope.is_cancelled() {
                ctx.cancel_branch(&mut branch);
                break;
            }
            if !ctx.take_step() {
                ctx.exceed_step_limit(&mut branch);
                break;
            }

            let state = graph.state(&branch.current_state).ok_or_else(|| {
                anyhow!(
                    "State '{}' not found in compiled graph",
                    branch.current_state
                )
            })?;

            let flow = match &state.kind {
                StateKind::Pass(pass) => ctx.step_pass(pass, &mut branch),
                StateKind::Wait(wait) => ctx.step_wait(wait, &mut branch),
                StateKind::Task(task) => ctx.step_task(task, &mut branch).await?,
                StateKind::Choice(choice) => ctx.step_choice(choice, &mut branch),
                StateKind::Parallel(parallel) => {
                    step_parallel(&ctx, parallel, &mut branch, &scope).await?
                }
                StateKind::Succeed => {
                    ctx.succeed(&mut branch);
                    Flow::Stop
                }
                StateKind::Fail { error, cause } => {
                    ctx.fail(&mut branch, ErrorInfo::new(error.clone(), cause.clone()));
                    Flow::Stop
                }
            };

            if flow == Flow::Stop {
                break;
            }
        }

        if matches!(branch.outcome, Some(BranchOutcome::Failed { .. })) {
            scope.cancel_group();
        }
        // The root's final state is committed by the caller
        if !branch.path.is_root() {
            ctx.checkpoint(&branch)?;
        }
        Ok(branch)
    }
    .boxed()
}

async fn step_parallel(
    ctx: &Arc<DriveContext>,
    parallel: &ParallelState,
    branch: &mut BranchState,
    scope: &CancelScope,
) -> Result<Flow> {
    if branch.suspension.is_none() {
        branch.attempts += 1;
        let input = match parallel.input.select(&branch.document) {
            Ok(input) => input,
            Err(e) => return Ok(ctx.handle_failure(branch, eval_error(&e), &[], &parallel.catch)),
        };

        let now = ctx.now();
        branch.branches = parallel
            .branches
            .iter()
            .enumerate()
            .map(|(index, graph)| {
                BranchState::new(branch.path.child(index), &graph.start_at, input.clone(), now)
            })
            .collect();
        branch.suspension = Some(Suspension::Join);

        ctx.record(branch, TransitionKind::Forked, None, None, None);
        for child in &branch.branches {
            ctx.record(
                child,
                TransitionKind::Started,
                Some(&child.current_state),
                None,
                None,
            );
        }
        debug!(
            execution_id = %ctx.execution_id,
            state = %branch.current_state,
            branches = branch.branches.len(),
            "Forked parallel branches"
        );
        ctx.checkpoint(branch)?;
    }

    let group = scope.fork();
    let mut children = std::mem::take(&mut branch.branches);

    let mut handles = Vec::new();
    for (index, child) in children.iter().enumerate() {
        if !child.is_runnable() {
            continue;
        }
        let graph = parallel.branches.get(index).cloned().ok_or_else(|| {
            anyhow!(
                "Parallel state '{}' has no branch {}",
                branch.current_state,
                index
            )
        })?;
        let handle = tokio::spawn(run_branch(ctx.clone(), graph, child.clone(), group.clone()));
        handles.push(async move { (index, handle.await) });
    }

    for (index, joined) in join_all(handles).await {
        match joined {
            Ok(Ok(state)) => children[index] = state,
            Ok(Err(e)) => return Err(e),
            Err(join_error) => {
                let child = &mut children[index];
                child.suspension = None;
                child.resumption = None;
                ctx.fail(
                    child,
                    ErrorInfo::new(
                        error_codes::BRANCH_FAILED,
                        format!("branch task ended abnormally: {}", join_error),
                    ),
                );
                group.cancel_group();
            }
        }
    }

    let failure = children.iter().find_map(|child| match &child.outcome {
        Some(BranchOutcome::Failed { error }) => Some(error.clone()),
        _ => None,
    });

    if failure.is_some() || scope.is_cancelled() {
        for child in children.iter_mut() {
            ctx.cancel_branch(child);
        }
    }
    branch.branches = children;

    if scope.is_cancelled() {
        ctx.cancel_branch(branch);
        return Ok(Flow::Stop);
    }

    if let Some(error) = failure {
        branch.branches.clear();
        branch.suspension = None;
        ctx.record(branch, TransitionKind::Joined, None, Some(error.clone()), None);
        return Ok(ctx.handle_failure(branch, error, &[], &parallel.catch));
    }

    if !branch.branches.iter().all(BranchState::is_finished) {
        return Ok(Flow::Stop);
    }

    let outputs: Vec<Value> = branch
        .branches
        .drain(..)
        .map(|child| match child.outcome {
            Some(BranchOutcome::Succeeded { output }) => output,
            _ => Value::Null,
        })
        .collect();
    branch.suspension = None;

    if let Err(e) = parallel
        .result_path
        .apply(&mut branch.document, Value::Array(outputs))
    {
        return Ok(ctx.handle_failure(branch, eval_error(&e), &[], &parallel.catch));
    }
    ctx.record(branch, TransitionKind::Joined, None, None, None);
    Ok(ctx.advance(branch, &parallel.next))
}

impl DriveContext {
    fn new(
        engine: Engine,
        execution_id: Uuid,
        root: &BranchState,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Self {
        Self {
            engine,
            execution_id,
            journal: Mutex::new(Journal::default()),
            tree: Mutex::new(root.clone()),
            sink,
            steps: AtomicU64::new(0),
        }
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `branch` and hand the sink everything it and its sub-branches
    /// produced since their last checkpoint
    fn checkpoint(&self, branch: &BranchState) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };

        let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        match tree.find_mut(&branch.path) {
            Some(node) => *node = branch.clone(),
            None => {
                return Err(anyhow!(
                    "Branch {} is missing from the published tree",
                    branch.path
                ))
            }
        }

        let progress = self.journal().take_within(&branch.path);
        if progress.is_empty() {
            return Ok(());
        }
        sink.checkpoint(progress.into_report(tree.clone()))
    }

    /// Count one step; false once the drive has used up its allowance
    fn take_step(&self) -> bool {
        self.steps.fetch_add(1, Ordering::SeqCst) < self.engine.settings.max_transitions
    }

    fn exceed_step_limit(&self, branch: &mut BranchState) {
        for child in branch.branches.iter_mut() {
            self.cancel_branch(child);
        }
        branch.suspension = None;
        branch.resumption = None;
        let error = ErrorInfo::new(
            error_codes::TRANSITION_LIMIT_EXCEEDED,
            format!(
                "more than {} steps without waiting",
                self.engine.settings.max_transitions
            ),
        );
        self.fail(branch, error);
    }

    fn now(&self) -> DateTime<Utc> {
        self.engine.clock.now()
    }

    fn record(
        &self,
        branch: &BranchState,
        kind: TransitionKind,
        to_state: Option<&str>,
        error: Option<ErrorInfo>,
        attempt: Option<u32>,
    ) {
        let from_state = match kind {
            TransitionKind::Started => None,
            _ => Some(branch.current_state.clone()),
        };
        let record = TransitionRecord {
            sequence: 0,
            execution_id: self.execution_id,
            branch: branch.path.clone(),
            from_state,
            to_state: to_state.map(str::to_string),
            kind,
            timestamp: self.now(),
            document: branch.document.clone(),
            error,
            attempt,
        };
        self.journal().records.push(record);
    }

    fn schedule(&self, branch: &BranchPath, due: DateTime<Utc>, action: TimerAction) {
        self.journal()
            .timers
            .push((branch.clone(), TimerEntry { due, action }));
    }

    fn enter(&self, branch: &mut BranchState, target: &str) {
        branch.current_state = target.to_string();
        branch.attempts = 0;
        branch.entered_at = self.now();
        branch.suspension = None;
        branch.resumption = None;
    }

    fn advance(&self, branch: &mut BranchState, next: &Transition) -> Flow {
        match next {
            Transition::Next(target) => {
                self.record(branch, TransitionKind::Transition, Some(target), None, None);
                info!(
                    execution_id = %self.execution_id,
                    branch = %branch.path,
                    "{} -> {}",
                    branch.current_state,
                    target
                );
                self.enter(branch, target);
                Flow::Continue
            }
            Transition::End => {
                self.succeed(branch);
                Flow::Stop
            }
        }
    }

    fn succeed(&self, branch: &mut BranchState) {
        branch.outcome = Some(BranchOutcome::Succeeded {
            output: branch.document.clone(),
        });
        self.record(branch, TransitionKind::Succeeded, None, None, None);
        debug!(
            execution_id = %self.execution_id,
            branch = %branch.path,
            state = %branch.current_state,
            "Branch succeeded"
        );
    }

    fn fail(&self, branch: &mut BranchState, error: ErrorInfo) {
        info!(
            execution_id = %self.execution_id,
            branch = %branch.path,
            state = %branch.current_state,
            "Branch failed: {}",
            error
        );
        self.record(branch, TransitionKind::Failed, None, Some(error.clone()), None);
        branch.outcome = Some(BranchOutcome::Failed { error });
    }

    fn resume(&self, branch: &mut BranchState) {
        branch.suspension = None;
        self.record(branch, TransitionKind::Resumed, None, None, Some(branch.attempts));
    }

    fn suspend(&self, branch: &mut BranchState, suspension: Suspension) {
        branch.suspension = Some(suspension);
        self.record(branch, TransitionKind::Suspended, None, None, Some(branch.attempts));
    }

    fn cancel_branch(&self, branch: &mut BranchState) {
        if branch.outcome.is_some() {
            return;
        }
        for child in branch.branches.iter_mut() {
            self.cancel_branch(child);
        }
        if let Some(Suspension::Callback { token, .. }) = &branch.suspension {
            match self.engine.callbacks.discard(token) {
                Ok(_) => {
                    debug!(token = %token, "Discarded task token of cancelled branch");
                    self.journal()
                        .discarded
                        .push((branch.path.clone(), token.clone()));
                }
                Err(CallbackError::AlreadyResolved(_)) | Err(CallbackError::UnknownToken(_)) => {}
                Err(e) => warn!(token = %token, "Failed to discard task token: {}", e),
            }
        }
        branch.suspension = None;
        branch.resumption = None;
        branch.outcome = Some(BranchOutcome::Cancelled);
        self.record(branch, TransitionKind::Cancelled, None, None, None);
    }

    /// Apply retry and catch policies to a failed attempt
    fn handle_failure(
        &self,
        branch: &mut BranchState,
        error: ErrorInfo,
        retriers: &[Retrier],
        catchers: &[Catcher],
    ) -> Flow {
        let action = decide(
            &error,
            branch.attempts,
            retriers,
            catchers,
            self.engine.settings.max_backoff,
        );

        match action {
            FailureAction::Retry { delay } => {
                let current = branch.current_state.clone();
                self.record(
                    branch,
                    TransitionKind::Retry,
                    Some(&current),
                    Some(error.clone()),
                    Some(branch.attempts),
                );
                info!(
                    execution_id = %self.execution_id,
                    branch = %branch.path,
                    state = %current,
                    attempt = branch.attempts,
                    "Retrying after {:?}: {}",
                    delay,
                    error
                );
                if delay.is_zero() {
                    return Flow::Continue;
                }
                let resume_at = self.now() + chrono_duration(delay);
                self.schedule(
                    &branch.path,
                    resume_at,
                    TimerAction::Resume {
                        execution_id: self.execution_id,
                        branch: branch.path.clone(),
                    },
                );
                self.suspend(
                    branch,
                    Suspension::Timer {
                        resume_at,
                        reason: TimerReason::RetryBackoff,
                    },
                );
                Flow::Stop
            }
            FailureAction::Catch { catcher_index } => {
                let catcher = &catchers[catcher_index];
                let payload = json!({ "error": error.error, "cause": error.cause });
                if let Err(e) = catcher.result_path.apply(&mut branch.document, payload) {
                    self.fail(branch, eval_error(&e));
                    return Flow::Stop;
                }
                self.record(
                    branch,
                    TransitionKind::Caught,
                    Some(&catcher.next),
                    Some(error),
                    Some(branch.attempts),
                );
                self.enter(branch, &catcher.next);
                Flow::Continue
            }
            FailureAction::Propagate => {
                self.fail(branch, error);
                Flow::Stop
            }
        }
    }

    fn step_pass(&self, pass: &PassState, branch: &mut BranchState) -> Flow {
        let value = match pass.compute(&branch.document) {
            Ok(value) => value,
            Err(e) => {
                self.fail(branch, eval_error(&e));
                return Flow::Stop;
            }
        };
        if let Err(e) = pass.result_path.apply(&mut branch.document, value) {
            self.fail(branch, eval_error(&e));
            return Flow::Stop;
        }
        self.advance(branch, &pass.next)
    }

    fn step_wait(&self, wait: &WaitState, branch: &mut BranchState) -> Flow {
        match branch.resumption.take() {
            Some(Resumption::TimerFired) => {
                self.resume(branch);
                return self.advance(branch, &wait.next);
            }
            Some(other) => {
                warn!(
                    execution_id = %self.execution_id,
                    state = %branch.current_state,
                    "Ignoring unexpected wake-up {:?}",
                    other
                );
            }
            None => {}
        }
        if branch.suspension.is_some() {
            return Flow::Stop;
        }

        let duration = match wait.compute(&branch.document) {
            Ok(duration) => duration,
            Err(e) => {
                self.fail(branch, eval_error(&e));
                return Flow::Stop;
            }
        };
        if duration.is_zero() {
            return self.advance(branch, &wait.next);
        }

        let resume_at = self.now() + chrono_duration(duration);
        self.schedule(
            &branch.path,
            resume_at,
            TimerAction::Resume {
                execution_id: self.execution_id,
                branch: branch.path.clone(),
            },
        );
        self.suspend(
            branch,
            Suspension::Timer {
                resume_at,
                reason: TimerReason::Wait,
            },
        );
        Flow::Stop
    }

    fn step_choice(&self, choice: &ChoiceState, branch: &mut BranchState) -> Flow {
        for rule in &choice.rules {
            match rule.condition.evaluate_bool(&branch.document) {
                Ok(true) => return self.advance(branch, &Transition::Next(rule.next.clone())),
                Ok(false) => {}
                Err(e) => {
                    self.fail(branch, eval_error(&e));
                    return Flow::Stop;
                }
            }
        }

        match &choice.default {
            Some(default) => self.advance(branch, &Transition::Next(default.clone())),
            None => {
                let error = ErrorInfo::new(
                    error_codes::NO_MATCHING_CHOICE,
                    format!("no choice rule matched in state '{}'", branch.current_state),
                );
                self.fail(branch, error);
                Flow::Stop
            }
        }
    }

    async fn step_task(&self, task: &TaskState, branch: &mut BranchState) -> Result<Flow> {
        match branch.resumption.take() {
            Some(Resumption::TaskSucceeded { output }) => {
                self.resume(branch);
                return Ok(self.task_succeeded(task, branch, output));
            }
            Some(Resumption::TaskFailed { error }) => {
                self.resume(branch);
                return Ok(self.handle_failure(branch, error, &task.retry, &task.catch));
            }
            Some(Resumption::TimerFired) => self.resume(branch),
            None if branch.suspension.is_some() => return Ok(Flow::Stop),
            None => {}
        }

        branch.attempts += 1;
        let payload = match task.input.select(&branch.document) {
            Ok(payload) => payload,
            Err(e) => return Ok(self.handle_failure(branch, eval_error(&e), &task.retry, &task.catch)),
        };
        let input = TaskInput {
            execution_id: self.execution_id,
            state_name: branch.current_state.clone(),
            branch: branch.path.clone(),
            resource: task.resource.clone(),
            payload,
            attempt: branch.attempts,
        };

        match task.mode {
            TaskMode::Sync => {
                // Steps before a sync call are durable before the call is made
                self.checkpoint(branch)?;
                match self.invoke_sync(task, input).await {
                    Ok(output) => Ok(self.task_succeeded(task, branch, output)),
                    Err(error) => Ok(self.handle_failure(branch, error, &task.retry, &task.catch)),
                }
            }
            TaskMode::Callback => self.dispatch_callback(task, branch, input),
        }
    }

    async fn invoke_sync(&self, task: &TaskState, input: TaskInput) -> Result<Value, ErrorInfo> {
        let executor = self.engine.executors.get(&task.resource).ok_or_else(|| {
            ErrorInfo::new(
                error_codes::TASK_FAILED,
                format!("no executor registered for resource '{}'", task.resource),
            )
        })?;

        debug!(
            execution_id = %input.execution_id,
            state = %input.state_name,
            resource = %task.resource,
            attempt = input.attempt,
            "Invoking task"
        );

        let call = executor.invoke(input);
        match task.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result.map_err(ErrorInfo::from),
                Err(_) => Err(ErrorInfo::new(
                    error_codes::TASK_TIMED_OUT,
                    format!("task did not finish within {}s", limit.as_secs()),
                )),
            },
            None => call.await.map_err(ErrorInfo::from),
        }
    }

    fn dispatch_callback(
        &self,
        task: &TaskState,
        branch: &mut BranchState,
        input: TaskInput,
    ) -> Result<Flow> {
        let timeout = task
            .timeout
            .unwrap_or(self.engine.settings.default_callback_timeout);
        let callback = self.engine.callbacks.register(
            self.execution_id,
            branch.path.clone(),
            &branch.current_state,
            &task.resource,
            input.payload.clone(),
            timeout,
        )?;

        self.schedule(
            &branch.path,
            callback.timeout_at,
            TimerAction::ExpireCallback {
                execution_id: self.execution_id,
                token: callback.token.clone(),
            },
        );
        self.journal().dispatches.push(Dispatch {
            token: callback.token.clone(),
            input,
        });
        self.suspend(
            branch,
            Suspension::Callback {
                token: callback.token,
                timeout_at: callback.timeout_at,
            },
        );
        Ok(Flow::Stop)
    }

    fn task_succeeded(&self, task: &TaskState, branch: &mut BranchState, output: Value) -> Flow {
        if let Err(e) = task.result_path.apply(&mut branch.document, output) {
            return self.handle_failure(branch, eval_error(&e), &task.retry, &task.catch);
        }
        self.advance(branch, &task.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::definition::StateMachineDefinition;
    use crate::models::execution::BranchPath;
    use crate::workflow::compiler::compile;
    use crate::workflow::executor::{FnExecutor, TaskError};
    use crate::workflow::persistence::MemoryStore;
    use crate::workflow::timer::SystemClock;

    fn engine(executors: ExecutorRegistry) -> Engine {
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let callbacks = Arc::new(CallbackRegistry::load(store, clock.clone()).unwrap());
        Engine::new(executors, callbacks, clock, EngineSettings::default())
    }

    async fn drive(engine: &Engine, yaml: &str, input: Value) -> DriveReport {
        let machine = compile(&StateMachineDefinition::from_yaml(yaml).unwrap()).unwrap();
        let graph = machine.graph().clone();
        let root = BranchState::new(BranchPath::root(), &graph.start_at, input, Utc::now());
        engine
            .drive(Uuid::new_v4(), graph, root, Arc::new(AtomicBool::new(false)), None)
            .await
            .unwrap()
    }

    /// Keeps every checkpoint it receives
    #[derive(Default)]
    struct Recorder {
        checkpoints: Mutex<Vec<DriveReport>>,
    }

    impl ProgressSink for Recorder {
        fn checkpoint(&self, progress: DriveReport) -> Result<()> {
            self.checkpoints.lock().unwrap().push(progress);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pass_and_choice() {
        let report = drive(
            &engine(ExecutorRegistry::new()),
            r#"
name: m
start_at: Count
states:
  - {type: pass, name: Count, expression: "$.count + 1", result_path: $.count, next: Check}
  - type: choice
    name: Check
    choices:
      - {condition: "$.count >= 2", next: Done}
    default: Count
  - {type: succeed, name: Done}
"#,
            json!({"count": 0}),
        )
        .await;

        assert_eq!(
            report.root.outcome,
            Some(BranchOutcome::Succeeded {
                output: json!({"count": 2})
            })
        );
        assert!(report.records.iter().any(|r| r.kind == TransitionKind::Succeeded));
    }

    #[tokio::test]
    async fn test_caught_failure_writes_error() {
        let executors = ExecutorRegistry::new();
        executors.register(
            "boom",
            Arc::new(FnExecutor::sync(|_| async {
                Err(TaskError::new("Custom", "exploded"))
            })),
        );
        let report = drive(
            &engine(executors),
            r#"
name: m
start_at: Work
states:
  - type: task
    name: Work
    resource: boom
    catch:
      - {errors: [Custom], next: Recovered}
    end: true
  - {type: succeed, name: Recovered}
"#,
            json!({}),
        )
        .await;

        match report.root.outcome {
            Some(BranchOutcome::Succeeded { output }) => {
                assert_eq!(output["error"], json!({"error": "Custom", "cause": "exploded"}));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_callback_task_parks_with_dispatch() {
        let report = drive(
            &engine(ExecutorRegistry::new()),
            "name: m\nstart_at: W\nstates:\n  - {type: task, name: W, resource: worker, mode: callback, end: true}\n",
            json!({"job": 1}),
        )
        .await;

        assert!(report.root.outcome.is_none());
        assert!(matches!(report.root.suspension, Some(Suspension::Callback { .. })));
        assert_eq!(report.dispatches.len(), 1);
        assert_eq!(report.timers.len(), 1);
        assert!(!report.root.is_runnable());
    }

    #[tokio::test]
    async fn test_stop_flag_cancels() {
        let machine = compile(
            &StateMachineDefinition::from_yaml(
                "name: m\nstart_at: A\nstates:\n  - {type: succeed, name: A}\n",
            )
            .unwrap(),
        )
        .unwrap();
        let engine = engine(ExecutorRegistry::new());
        let root = BranchState::new(BranchPath::root(), "A", json!({}), Utc::now());
        let report = engine
            .drive(
                Uuid::new_v4(),
                machine.graph().clone(),
                root,
                Arc::new(AtomicBool::new(true)),
                None,
            )
            .await
            .unwrap();
        assert_eq!(report.root.outcome, Some(BranchOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_steps_are_checkpointed_before_sync_call() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let executors = ExecutorRegistry::new();
        let recorder = Arc::new(Recorder::default());
        {
            let seen = seen.clone();
            let recorder = recorder.clone();
            executors.register(
                "inspect",
                Arc::new(FnExecutor::sync(move |_| {
                    let checkpoints = recorder.checkpoints.lock().unwrap();
                    let last = checkpoints.last().map(|c| c.root.current_state.clone());
                    seen.lock().unwrap().push(last);
                    async { Ok(json!("done")) }
                })),
            );
        }

        let machine = compile(
            &StateMachineDefinition::from_yaml(
                r#"
name: m
start_at: A
states:
  - {type: pass, name: A, next: B}
  - {type: pass, name: B, next: T}
  - {type: task, name: T, resource: inspect, result_path: $.t, end: true}
"#,
            )
            .unwrap(),
        )
        .unwrap();
        let root = BranchState::new(BranchPath::root(), "A", json!({}), Utc::now());
        let sink: Arc<dyn ProgressSink> = recorder.clone();
        let report = engine(executors)
            .drive(
                Uuid::new_v4(),
                machine.graph().clone(),
                root,
                Arc::new(AtomicBool::new(false)),
                Some(sink),
            )
            .await
            .unwrap();

        // The task saw A -> B -> T already handed over
        assert_eq!(*seen.lock().unwrap(), vec![Some("T".to_string())]);
        let checkpoints = recorder.checkpoints.lock().unwrap();
        let committed: Vec<TransitionKind> = checkpoints
            .iter()
            .flat_map(|c| c.records.iter().map(|r| r.kind))
            .collect();
        assert_eq!(
            committed,
            vec![TransitionKind::Transition, TransitionKind::Transition]
        );
        // Only the final success is left for the caller
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].kind, TransitionKind::Succeeded);
    }

    #[tokio::test]
    async fn test_step_limit_fails_endless_loop() {
        let executors = ExecutorRegistry::new();
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let callbacks = Arc::new(CallbackRegistry::load(store, clock.clone()).unwrap());
        let settings = EngineSettings {
            max_transitions: 50,
            ..EngineSettings::default()
        };
        let engine = Engine::new(executors, callbacks, clock, settings);

        let report = drive(
            &engine,
            r#"
name: m
start_at: Count
states:
  - {type: pass, name: Count, expression: "$.count + 1", result_path: $.count, next: Check}
  - type: choice
    name: Check
    choices:
      - {condition: "$.count < 0", next: Done}
    default: Count
  - {type: succeed, name: Done}
"#,
            json!({"count": 0}),
        )
        .await;

        match report.root.outcome {
            Some(BranchOutcome::Failed { error }) => {
                assert_eq!(error.error, error_codes::TRANSITION_LIMIT_EXCEEDED);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let steps = report
            .records
            .iter()
            .filter(|r| r.kind == TransitionKind::Transition)
            .count();
        assert_eq!(steps, 50);
    }
}
