//! Execution lifecycle management
//!
//! The orchestrator owns compiled definitions, the timer queue and one lock
//! per execution. Every change to an execution happens under its lock:
//! load, apply the wake-up, drive. While the drive runs, each step boundary
//! commits state and history together, then arms timers and dispatches
//! callbacks, so a crash loses at most the step in progress.

use crate::models::configuration::Configuration;
use crate::models::definition::StateMachineDefinition;
use crate::models::execution::{
    error_codes, BranchOutcome, BranchPath, BranchState, ErrorInfo, Execution, ExecutionStatus,
    Resumption, Suspension, TransitionKind, TransitionRecord,
};
use crate::services::logging;
use crate::workflow::callback_registry::{CallbackError, CallbackOutcome, CallbackRegistry};
use crate::workflow::compiler::{compile, CompileError};
use crate::workflow::engine::{Dispatch, DriveReport, Engine, EngineSettings, ProgressSink};
use crate::workflow::executor::{ExecutorRegistry, TaskInput};
use crate::workflow::machine::StateMachine;
use crate::workflow::persistence::{ExecutionStore, JsonFileStore};
use crate::workflow::timer::{Clock, SystemClock, TimerAction, TimerEntry, TimerQueue};
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("definition '{0}' not found")]
    DefinitionNotFound(String),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("invalid definition: {0}")]
    InvalidDefinition(#[from] CompileError),

    #[error("execution {0} did not complete in time")]
    Timeout(Uuid),

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// What [`Orchestrator::recover`] found in the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub definitions: usize,
    /// Executions driven again because they had runnable work
    pub resumed: usize,
    pub timers: usize,
    /// Callbacks whose dispatch never reached the executor
    pub redispatched: usize,
    /// Tokens nobody waits on any more
    pub discarded: usize,
}

/// Event delivered to a suspended branch
#[derive(Debug, Clone)]
enum Wake {
    Timer {
        branch: BranchPath,
    },
    Task {
        branch: BranchPath,
        token: String,
        resumption: Resumption,
    },
}

/// Handle to the running engine; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ExecutionStore>,
    engine: Engine,
    machines: DashMap<String, Arc<StateMachine>>,
    timers: TimerQueue,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    stop_flags: DashMap<Uuid, Arc<AtomicBool>>,
    stop_causes: DashMap<Uuid, String>,
    /// Drives and dispatches still in flight, per execution
    active: DashMap<Uuid, Vec<JoinHandle<()>>>,
    /// Signalled after every commit
    changed: Notify,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        executors: ExecutorRegistry,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> anyhow::Result<Self> {
        let callbacks = Arc::new(CallbackRegistry::load(store.clone(), clock.clone())?);
        let engine = Engine::new(executors, callbacks, clock, settings);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                engine,
                machines: DashMap::new(),
                timers: TimerQueue::new(),
                locks: DashMap::new(),
                stop_flags: DashMap::new(),
                stop_causes: DashMap::new(),
                active: DashMap::new(),
                changed: Notify::new(),
            }),
        })
    }

    /// Orchestrator backed by the JSON store named in `config`
    pub fn from_config(config: &Configuration, executors: ExecutorRegistry) -> anyhow::Result<Self> {
        let store = JsonFileStore::open(&config.store_path).with_context(|| {
            format!("Failed to open store at {}", config.store_path.display())
        })?;
        Self::new(
            Arc::new(store),
            executors,
            Arc::new(SystemClock),
            EngineSettings::from(config),
        )
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.inner.store
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        self.inner.engine.executors()
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        self.inner.engine.callbacks()
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.inner.engine.clock()
    }

    /// Compile and persist a definition, replacing any previous version
    pub fn register_definition(
        &self,
        definition: StateMachineDefinition,
    ) -> Result<Arc<StateMachine>> {
        let machine = Arc::new(compile(&definition)?);
        self.inner
            .store
            .put_definition(&definition)
            .context("Failed to persist definition")?;
        self.inner
            .machines
            .insert(definition.name.clone(), machine.clone());

        info!(
            "Registered definition '{}' ({} warnings)",
            definition.name,
            machine.warnings().len()
        );
        Ok(machine)
    }

    /// Names of registered definitions, sorted
    pub fn list_definitions(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .inner
            .store
            .list_definitions()?
            .into_iter()
            .map(|definition| definition.name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub fn get_definition(&self, name: &str) -> Result<StateMachineDefinition> {
        self.inner
            .store
            .get_definition(name)?
            .ok_or_else(|| OrchestratorError::DefinitionNotFound(name.to_string()))
    }

    fn machine(&self, name: &str) -> Result<Arc<StateMachine>> {
        if let Some(machine) = self.inner.machines.get(name) {
            return Ok(machine.clone());
        }
        let definition = self.get_definition(name)?;
        let machine = Arc::new(compile(&definition)?);
        self.inner
            .machines
            .insert(name.to_string(), machine.clone());
        Ok(machine)
    }

    /// Start a new execution; it advances in the background
    pub fn start_execution(&self, definition_id: &str, input: Value) -> Result<Uuid> {
        let machine = self.machine(definition_id)?;
        let now = self.clock().now();
        let id = Uuid::new_v4();
        let root = BranchState::new(
            BranchPath::root(),
            &machine.graph().start_at,
            input.clone(),
            now,
        );

        let execution = Execution {
            id,
            definition_id: definition_id.to_string(),
            status: ExecutionStatus::Running,
            input,
            root,
            output: None,
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.inner
            .store
            .create_execution(&execution)
            .context("Failed to create execution")?;
        self.inner.store.append_history(root_record(
            &execution,
            TransitionKind::Started,
            None,
            now,
        ))?;

        info!(
            "Started execution {} of '{}' at state '{}'",
            id,
            definition_id,
            execution.current_state()
        );
        self.spawn_drive(id, None);
        Ok(id)
    }

    pub fn get_execution(&self, id: Uuid) -> Result<Execution> {
        self.inner
            .store
            .get_execution(id)?
            .ok_or(OrchestratorError::ExecutionNotFound(id))
    }

    pub fn list_executions(&self, status: Option<ExecutionStatus>) -> Result<Vec<Execution>> {
        Ok(self.inner.store.list_executions(status)?)
    }

    /// Ordered transition history of an execution
    pub fn history(&self, id: Uuid) -> Result<Vec<TransitionRecord>> {
        self.get_execution(id)?;
        Ok(self.inner.store.history(id)?)
    }

    /// Resolve a task token and resume the branch waiting on it
    pub fn complete_task(&self, token: &str, outcome: CallbackOutcome) -> Result<()> {
        let callback = self.callbacks().resolve(token, &outcome)?;
        self.inner.timers.cancel_callback(token);

        info!(
            execution_id = %callback.execution_id,
            state = %callback.state_name,
            "Task token {} completed ({:?})",
            token,
            callback.status
        );

        if let Some(resumption) = callback.resolution {
            self.spawn_drive(
                callback.execution_id,
                Some(Wake::Task {
                    branch: callback.branch,
                    token: callback.token,
                    resumption,
                }),
            );
        }
        Ok(())
    }

    /// Fire every timer due by now; returns how many fired
    pub fn fire_due_timers(&self) -> usize {
        let due = self.inner.timers.take_due(self.clock().now());
        let fired = due.len();

        for entry in due {
            match entry.action {
                TimerAction::Resume {
                    execution_id,
                    branch,
                } => {
                    debug!(%execution_id, branch = %branch, "Timer fired");
                    self.spawn_drive(execution_id, Some(Wake::Timer { branch }));
                }
                TimerAction::ExpireCallback {
                    execution_id,
                    token,
                } => match self.callbacks().expire(&token) {
                    Ok(callback) => {
                        warn!(
                            execution_id = %callback.execution_id,
                            state = %callback.state_name,
                            "Task token {} timed out",
                            token
                        );
                        if let Some(resumption) = callback.resolution {
                            self.spawn_drive(
                                callback.execution_id,
                                Some(Wake::Task {
                                    branch: callback.branch,
                                    token,
                                    resumption,
                                }),
                            );
                        }
                    }
                    Err(CallbackError::AlreadyResolved(_)) | Err(CallbackError::UnknownToken(_)) => {}
                    Err(e) => {
                        error!("Failed to expire task token {}: {}", token, e);
                        self.inner.timers.schedule(
                            entry.due,
                            TimerAction::ExpireCallback {
                                execution_id,
                                token,
                            },
                        );
                    }
                },
            }
        }
        self.prune_finished();
        fired
    }

    /// Poll the timer queue every `tick` until the handle is aborted
    pub fn spawn_timer_loop(&self, tick: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                this.fire_due_timers();
            }
        })
    }

    /// Number of armed timers
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.len()
    }

    /// Stop an execution: cancel every branch, discard its task tokens and
    /// fail it with `ExecutionStopped`
    pub async fn stop_execution(&self, id: Uuid, cause: Option<String>) -> Result<Execution> {
        let execution = self.get_execution(id)?;
        if execution.is_terminal() {
            return Ok(execution);
        }

        let cause = cause.unwrap_or_else(|| "execution stopped by request".to_string());
        self.inner.stop_causes.insert(id, cause);
        self.stop_flag(id).store(true, Ordering::SeqCst);

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut execution = self.get_execution(id)?;
        if execution.is_terminal() {
            self.forget(id);
            return Ok(execution);
        }

        let tokens = execution.root.pending_tokens();
        let mut records = self.inner.engine.cancel(id, &mut execution.root);
        self.conclude(&mut execution, &mut records);
        self.inner
            .store
            .commit(&execution, records)
            .context("Failed to persist stopped execution")?;
        for token in &tokens {
            self.inner.timers.cancel_callback(token);
        }
        self.finish(&execution);
        Ok(execution)
    }

    /// Wait until the execution reaches a terminal status
    pub async fn wait_for_completion(&self, id: Uuid, timeout: Duration) -> Result<Execution> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let execution = self.get_execution(id)?;
            if execution.is_terminal() {
                return Ok(execution);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(OrchestratorError::Timeout(id));
            }
        }
    }

    /// Wait for every drive and dispatch in flight for an execution
    pub async fn settle(&self, id: Uuid) {
        loop {
            let handles = self
                .inner
                .active
                .remove(&id)
                .map(|(_, handles)| handles)
                .unwrap_or_default();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Background task of execution {} ended abnormally: {}", id, e);
                }
            }
        }
    }

    /// Rebuild in-memory state from the store after a restart
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for definition in self.inner.store.list_definitions()? {
            match compile(&definition) {
                Ok(machine) => {
                    self.inner
                        .machines
                        .insert(definition.name.clone(), Arc::new(machine));
                    report.definitions += 1;
                }
                Err(e) => warn!("Skipping stored definition '{}': {}", definition.name, e),
            }
        }

        for callback in self.callbacks().pending() {
            let waiting = match self.inner.store.get_execution(callback.execution_id)? {
                Some(execution) if !execution.is_terminal() => {
                    waits_on(&execution.root, &callback.branch, &callback.token)
                }
                _ => None,
            };

            let Some(attempt) = waiting else {
                if self.callbacks().discard(&callback.token).is_ok() {
                    report.discarded += 1;
                }
                continue;
            };

            self.inner.timers.schedule(
                callback.timeout_at,
                TimerAction::ExpireCallback {
                    execution_id: callback.execution_id,
                    token: callback.token.clone(),
                },
            );
            report.timers += 1;

            if callback.dispatched_at.is_none() {
                let input = TaskInput {
                    execution_id: callback.execution_id,
                    state_name: callback.state_name.clone(),
                    branch: callback.branch.clone(),
                    resource: callback.resource.clone(),
                    payload: callback.input.clone(),
                    attempt,
                };
                self.dispatch(Dispatch {
                    token: callback.token.clone(),
                    input,
                });
                report.redispatched += 1;
            }
        }

        for execution in self.inner.store.list_executions(None)? {
            if execution.is_terminal() {
                continue;
            }
            for (branch, due) in execution.root.pending_timers() {
                self.inner.timers.schedule(
                    due,
                    TimerAction::Resume {
                        execution_id: execution.id,
                        branch,
                    },
                );
                report.timers += 1;
            }
            for wake in self.resolved_while_down(&execution.root)? {
                self.spawn_drive(execution.id, Some(wake));
                report.resumed += 1;
            }
            if execution.root.is_runnable() {
                self.spawn_drive(execution.id, None);
                report.resumed += 1;
            }
        }

        info!(
            "Recovered {} definitions, resumed {} executions, armed {} timers",
            report.definitions, report.resumed, report.timers
        );
        Ok(report)
    }

    /// Wake-ups for tokens resolved after their execution was last committed
    fn resolved_while_down(&self, root: &BranchState) -> Result<Vec<Wake>> {
        let mut wakes = Vec::new();
        let mut stack = vec![root];
        while let Some(branch) = stack.pop() {
            if branch.outcome.is_some() {
                continue;
            }
            stack.extend(branch.branches.iter());
            let Some(Suspension::Callback { token, .. }) = &branch.suspension else {
                continue;
            };
            if branch.resumption.is_some() || self.callbacks().is_pending(token) {
                continue;
            }
            if let Some(resumption) = self
                .inner
                .store
                .get_callback(token)?
                .and_then(|callback| callback.resolution)
            {
                wakes.push(Wake::Task {
                    branch: branch.path.clone(),
                    token: token.clone(),
                    resumption,
                });
            }
        }
        Ok(wakes)
    }

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn stop_flag(&self, id: Uuid) -> Arc<AtomicBool> {
        self.inner
            .stop_flags
            .entry(id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    fn track(&self, id: Uuid, handle: JoinHandle<()>) {
        let mut handles = self.inner.active.entry(id).or_default();
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }

    /// Drop bookkeeping for background work that has ended
    fn prune_finished(&self) {
        self.inner.active.retain(|_, handles| {
            handles.retain(|handle| !handle.is_finished());
            !handles.is_empty()
        });
    }

    /// Number of executions with bookkeeping still held in memory
    pub fn tracked_executions(&self) -> usize {
        let mut ids: Vec<Uuid> = self
            .inner
            .locks
            .iter()
            .map(|entry| *entry.key())
            .chain(self.inner.active.iter().map(|entry| *entry.key()))
            .collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    fn spawn_drive(&self, id: Uuid, wake: Option<Wake>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = this.drive(id, wake).await {
                error!("Failed to advance execution {}: {:#}", id, e);
            }
        });
        self.track(id, handle);
    }

    async fn drive(&self, id: Uuid, wake: Option<Wake>) -> anyhow::Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut execution = self
            .inner
            .store
            .get_execution(id)?
            .ok_or_else(|| anyhow!("Execution {} not found", id))?;
        if execution.is_terminal() {
            debug!("Execution {} already {}; nothing to drive", id, execution.status);
            return Ok(());
        }

        if let Some(wake) = &wake {
            if !apply_wake(&mut execution.root, wake, self.clock().now()) {
                debug!("Ignoring stale wake-up for execution {}: {:?}", id, wake);
                return Ok(());
            }
        }

        let machine = self.machine(&execution.definition_id)?;
        let checkpoints = Arc::new(Checkpoints {
            orchestrator: self.clone(),
            execution: std::sync::Mutex::new(execution.clone()),
        });
        let report = self
            .inner
            .engine
            .drive(
                id,
                machine.graph().clone(),
                execution.root.clone(),
                self.stop_flag(id),
                Some(checkpoints as Arc<dyn ProgressSink>),
            )
            .await?;

        execution.root = report.root;
        let mut records = report.records;
        self.conclude(&mut execution, &mut records);
        self.inner
            .store
            .commit(&execution, records)
            .with_context(|| format!("Failed to commit execution {}", id))?;
        self.publish(report.timers, report.dispatches, &report.discarded);

        self.finish(&execution);
        Ok(())
    }

    /// Arm timers and hand out dispatches of committed progress
    fn publish(&self, timers: Vec<TimerEntry>, dispatches: Vec<Dispatch>, discarded: &[String]) {
        for token in discarded {
            self.inner.timers.cancel_callback(token);
        }
        for timer in timers {
            self.inner.timers.schedule(timer.due, timer.action);
        }
        for dispatch in dispatches {
            if self.callbacks().is_pending(&dispatch.token) {
                self.dispatch(dispatch);
            }
        }
    }

    /// Derive the execution status from its root branch
    fn conclude(&self, execution: &mut Execution, records: &mut Vec<TransitionRecord>) {
        let now = self.clock().now();
        execution.updated_at = now;

        match &execution.root.outcome {
            Some(BranchOutcome::Succeeded { output }) => {
                execution.status = ExecutionStatus::Succeeded;
                execution.output = Some(output.clone());
                execution.completed_at = Some(now);
            }
            Some(BranchOutcome::Failed { error }) => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(error.clone());
                execution.completed_at = Some(now);
            }
            Some(BranchOutcome::Cancelled) => {
                let cause = self
                    .inner
                    .stop_causes
                    .get(&execution.id)
                    .map(|cause| cause.clone())
                    .unwrap_or_else(|| "execution stopped".to_string());
                let error = ErrorInfo::new(error_codes::EXECUTION_STOPPED, cause);
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(error.clone());
                execution.completed_at = Some(now);
                records.push(root_record(execution, TransitionKind::Failed, Some(error), now));
            }
            None if execution.root.is_runnable() => execution.status = ExecutionStatus::Running,
            None => execution.status = ExecutionStatus::Suspended,
        }
    }

    /// Post-commit bookkeeping
    fn finish(&self, execution: &Execution) {
        if execution.is_terminal() {
            self.inner.timers.cancel_execution(execution.id);
            self.forget(execution.id);
            if let Some(error) = &execution.error {
                logging::log_execution_failure(execution.id, error);
            }
        }
        logging::log_execution_event(execution.id, execution.status, execution.current_state());
        self.inner.changed.notify_waiters();
    }

    /// Drop in-memory state of a terminal execution. The caller still holds
    /// one reference to the lock; a lock anybody else holds is kept.
    fn forget(&self, id: Uuid) {
        self.inner.stop_flags.remove(&id);
        self.inner.stop_causes.remove(&id);
        self.inner
            .locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) <= 2);
        self.inner.active.remove_if(&id, |_, handles| {
            handles.iter().all(JoinHandle::is_finished)
        });
    }

    /// Hand a callback task to its executor in the background
    fn dispatch(&self, dispatch: Dispatch) {
        let this = self.clone();
        let execution_id = dispatch.input.execution_id;
        let handle = tokio::spawn(async move {
            let Dispatch { token, input } = dispatch;
            let result = match this.executors().get(&input.resource) {
                Some(executor) => executor
                    .invoke_async(input.clone(), token.clone())
                    .await
                    .map_err(ErrorInfo::from),
                None => Err(ErrorInfo::new(
                    error_codes::TASK_FAILED,
                    format!("no executor registered for resource '{}'", input.resource),
                )),
            };

            match result {
                Ok(()) => {
                    if let Err(e) = this.callbacks().mark_dispatched(&token) {
                        warn!("Failed to record dispatch of task token {}: {:#}", token, e);
                    }
                }
                Err(error) => {
                    warn!(
                        execution_id = %input.execution_id,
                        state = %input.state_name,
                        "Dispatch failed: {}",
                        error
                    );
                    match this.complete_task(&token, CallbackOutcome::Failure(error)) {
                        Ok(())
                        | Err(OrchestratorError::Callback(CallbackError::AlreadyResolved(_))) => {}
                        Err(e) => error!("Failed to fail task token {}: {}", token, e),
                    }
                }
            }
        });
        self.track(execution_id, handle);
    }
}

/// Commits a drive's progress while the drive is still running
struct Checkpoints {
    orchestrator: Orchestrator,
    execution: std::sync::Mutex<Execution>,
}

impl ProgressSink for Checkpoints {
    fn checkpoint(&self, progress: DriveReport) -> anyhow::Result<()> {
        let this = &self.orchestrator;
        let mut execution = self
            .execution
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        execution.root = progress.root;
        execution.status = ExecutionStatus::Running;
        execution.updated_at = this.clock().now();
        this.inner
            .store
            .commit(&execution, progress.records)
            .with_context(|| format!("Failed to commit progress of execution {}", execution.id))?;
        drop(execution);

        this.publish(progress.timers, progress.dispatches, &progress.discarded);
        this.inner.changed.notify_waiters();
        Ok(())
    }
}

/// Attempt number of the branch at `path` if it still waits on `token`
fn waits_on(root: &BranchState, path: &BranchPath, token: &str) -> Option<u32> {
    let branch = root.find(path)?;
    match &branch.suspension {
        Some(Suspension::Callback { token: waiting, .. })
            if waiting == token && branch.outcome.is_none() && branch.resumption.is_none() =>
        {
            Some(branch.attempts)
        }
        _ => None,
    }
}

/// Queue the wake-up on its branch; false when the branch no longer waits for it
fn apply_wake(root: &mut BranchState, wake: &Wake, now: DateTime<Utc>) -> bool {
    let (path, resumption) = match wake {
        Wake::Timer { branch } => (branch, Resumption::TimerFired),
        Wake::Task {
            branch, resumption, ..
        } => (branch, resumption.clone()),
    };
    let Some(branch) = root.find_mut(path) else {
        return false;
    };
    if branch.outcome.is_some() || branch.resumption.is_some() {
        return false;
    }

    let expected = match (&branch.suspension, wake) {
        (Some(Suspension::Timer { resume_at, .. }), Wake::Timer { .. }) => *resume_at <= now,
        (Some(Suspension::Callback { token, .. }), Wake::Task { token: fired, .. }) => {
            token == fired
        }
        _ => false,
    };
    if expected {
        branch.resumption = Some(resumption);
    }
    expected
}

fn root_record(
    execution: &Execution,
    kind: TransitionKind,
    error: Option<ErrorInfo>,
    now: DateTime<Utc>,
) -> TransitionRecord {
    let (from_state, to_state) = match kind {
        TransitionKind::Started => (None, Some(execution.root.current_state.clone())),
        _ => (Some(execution.root.current_state.clone()), None),
    };
    TransitionRecord {
        sequence: 0,
        execution_id: execution.id,
        branch: BranchPath::root(),
        from_state,
        to_state,
        kind,
        timestamp: now,
        document: execution.root.document.clone(),
        error,
        attempt: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::execution::TimerReason;
    use crate::workflow::persistence::MemoryStore;
    use serde_json::json;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(MemoryStore::new()),
            ExecutorRegistry::new(),
            Arc::new(SystemClock),
            EngineSettings::default(),
        )
        .unwrap()
    }

    fn definition(yaml: &str) -> StateMachineDefinition {
        StateMachineDefinition::from_yaml(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_run_to_completion() {
        let orchestrator = orchestrator();
        orchestrator
            .register_definition(definition(
                "name: hello\nstart_at: Say\nstates:\n  - {type: pass, name: Say, result: \"hi\", result_path: $.greeting, end: true}\n",
            ))
            .unwrap();
        assert_eq!(orchestrator.list_definitions().unwrap(), vec!["hello"]);

        let id = orchestrator.start_execution("hello", json!({})).unwrap();
        let execution = orchestrator
            .wait_for_completion(id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.output, Some(json!({"greeting": "hi"})));

        let history = orchestrator.history(id).unwrap();
        assert_eq!(history.first().map(|r| r.kind), Some(TransitionKind::Started));
        assert_eq!(history.last().map(|r| r.kind), Some(TransitionKind::Succeeded));
    }

    #[tokio::test]
    async fn test_unknown_definition_and_execution() {
        let orchestrator = orchestrator();
        assert!(matches!(
            orchestrator.start_execution("missing", json!({})),
            Err(OrchestratorError::DefinitionNotFound(_))
        ));
        assert!(matches!(
            orchestrator.get_execution(Uuid::new_v4()),
            Err(OrchestratorError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected() {
        let orchestrator = orchestrator();
        let result = orchestrator.register_definition(definition(
            "name: bad\nstart_at: Nowhere\nstates:\n  - {type: succeed, name: Done}\n",
        ));
        assert!(matches!(result, Err(OrchestratorError::InvalidDefinition(_))));
        assert!(orchestrator.list_definitions().unwrap().is_empty());
    }

    #[test]
    fn test_apply_wake_ignores_stale_events() {
        let now = Utc::now();
        let mut root = BranchState::new(BranchPath::root(), "Wait", json!({}), now);
        root.suspension = Some(Suspension::Timer {
            resume_at: now + chrono::Duration::seconds(30),
            reason: TimerReason::Wait,
        });
        let timer = Wake::Timer {
            branch: BranchPath::root(),
        };
        assert!(!apply_wake(&mut root, &timer, now));

        let wrong_token = Wake::Task {
            branch: BranchPath::root(),
            token: "other".to_string(),
            resumption: Resumption::TimerFired,
        };
        assert!(!apply_wake(&mut root, &wrong_token, now));

        assert!(apply_wake(&mut root, &timer, now + chrono::Duration::seconds(31)));
        assert_eq!(root.resumption, Some(Resumption::TimerFired));
        assert!(!apply_wake(&mut root, &timer, now + chrono::Duration::seconds(31)));
    }
}
