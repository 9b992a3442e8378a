//! Restart recovery from the JSON store, stop, and history replay

mod common;

use chrono::Utc;
use common::{accepting_callbacks, definition, Harness};
use serde_json::json;
use statewright_core::models::{
    BranchPath, BranchState, CallbackStatus, Execution, ExecutionStatus, TransitionKind,
};
use statewright_core::workflow::{
    replay, CallbackError, CallbackOutcome, EngineSettings, ExecutionStore, ExecutorRegistry,
    FnExecutor, JsonFileStore, ManualClock, Orchestrator, OrchestratorError, TaskInput,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const APPROVAL: &str = r#"
name: approval
start_at: Ask
states:
  - {type: task, name: Ask, resource: human, mode: callback, result_path: $.answer, next: Done}
  - {type: succeed, name: Done}
"#;

const NAP: &str = r#"
name: nap
start_at: Sleep
states:
  - {type: wait, name: Sleep, seconds: 10, next: Done}
  - {type: pass, name: Done, result: rested, result_path: $.state, end: true}
"#;

/// Orchestrator over the JSON store at `path`, as a fresh process would build it
fn open(path: &Path, executors: ExecutorRegistry) -> (Orchestrator, ManualClock) {
    let clock = ManualClock::new();
    let store = JsonFileStore::open(path).unwrap();
    let orchestrator = Orchestrator::new(
        Arc::new(store),
        executors,
        Arc::new(clock.clone()),
        EngineSettings {
            default_callback_timeout: Duration::from_secs(3600),
            max_backoff: None,
            ..EngineSettings::default()
        },
    )
    .unwrap();
    (orchestrator, clock)
}

fn humans() -> ExecutorRegistry {
    let executors = ExecutorRegistry::new();
    executors.register("human", accepting_callbacks());
    executors
}

async fn start(orchestrator: &Orchestrator, yaml: &str, input: serde_json::Value) -> Uuid {
    let definition = definition(yaml);
    let name = definition.name.clone();
    orchestrator.register_definition(definition).unwrap();
    let id = orchestrator.start_execution(&name, input).unwrap();
    orchestrator.settle(id).await;
    id
}

#[tokio::test]
async fn test_callback_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    let (id, token) = {
        let (orchestrator, _) = open(&path, humans());
        let id = start(&orchestrator, APPROVAL, json!({"ticket": 9})).await;
        let pending = orchestrator.callbacks().pending();
        assert_eq!(pending.len(), 1);
        (id, pending[0].token.clone())
    };

    let (orchestrator, _) = open(&path, humans());
    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.definitions, 1);
    assert_eq!(report.resumed, 0);
    assert_eq!(report.timers, 1);
    assert_eq!(report.redispatched, 0);
    assert_eq!(report.discarded, 0);
    assert_eq!(orchestrator.get_execution(id).unwrap().status, ExecutionStatus::Suspended);

    orchestrator
        .complete_task(&token, CallbackOutcome::Success(json!("yes")))
        .unwrap();
    orchestrator.settle(id).await;

    let execution = orchestrator.get_execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.output, Some(json!({"ticket": 9, "answer": "yes"})));
}

#[tokio::test]
async fn test_wait_timer_rebuilt_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    let id = {
        let (orchestrator, _) = open(&path, ExecutorRegistry::new());
        let id = start(&orchestrator, NAP, json!({})).await;
        assert_eq!(orchestrator.pending_timers(), 1);
        id
    };

    let (orchestrator, clock) = open(&path, ExecutorRegistry::new());
    assert_eq!(orchestrator.pending_timers(), 0);
    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.timers, 1);
    assert_eq!(orchestrator.pending_timers(), 1);

    clock.advance(Duration::from_secs(10));
    assert_eq!(orchestrator.fire_due_timers(), 1);
    orchestrator.settle(id).await;

    let execution = orchestrator.get_execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.output, Some(json!({"state": "rested"})));
}

#[tokio::test]
async fn test_undispatched_callback_is_dispatched_again() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    let (id, token) = {
        let (orchestrator, _) = open(&path, humans());
        let id = start(&orchestrator, APPROVAL, json!({})).await;
        (id, orchestrator.callbacks().pending()[0].token.clone())
    };

    // Crash between commit and dispatch
    {
        let store = JsonFileStore::open(&path).unwrap();
        let mut callback = store.get_callback(&token).unwrap().unwrap();
        callback.dispatched_at = None;
        store.put_callback(&callback).unwrap();
    }

    let received: Arc<Mutex<Vec<(String, TaskInput)>>> = Arc::new(Mutex::new(Vec::new()));
    let executors = ExecutorRegistry::new();
    let seen = received.clone();
    executors.register(
        "human",
        Arc::new(FnExecutor::callback(move |input, token| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push((token, input));
                Ok(())
            }
        })),
    );

    let (orchestrator, _) = open(&path, executors);
    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.redispatched, 1);
    orchestrator.settle(id).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, token);
    assert_eq!(received[0].1.execution_id, id);
    assert_eq!(received[0].1.attempt, 1);
    assert!(orchestrator
        .callbacks()
        .get(&token)
        .unwrap()
        .dispatched_at
        .is_some());
}

#[tokio::test]
async fn test_resolution_recorded_before_crash_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    let id = {
        let (orchestrator, _) = open(&path, humans());
        let id = start(&orchestrator, APPROVAL, json!({})).await;
        let token = orchestrator.callbacks().pending()[0].token.clone();
        // Resolved and persisted, but the branch never consumed it
        orchestrator
            .callbacks()
            .resolve(&token, &CallbackOutcome::Success(json!("late but kept")))
            .unwrap();
        id
    };

    let (orchestrator, _) = open(&path, humans());
    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.resumed, 1);
    orchestrator.settle(id).await;

    let execution = orchestrator.get_execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.output, Some(json!({"answer": "late but kept"})));
}

#[tokio::test]
async fn test_interrupted_execution_is_driven_again() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    let id = Uuid::new_v4();
    {
        let store = JsonFileStore::open(&path).unwrap();
        let now = Utc::now();
        let input = json!({"n": 1});
        store
            .put_definition(&definition(
                "name: quick\nstart_at: Mark\nstates:\n  - {type: pass, name: Mark, result: true, result_path: $.marked, end: true}\n",
            ))
            .unwrap();
        store
            .create_execution(&Execution {
                id,
                definition_id: "quick".to_string(),
                status: ExecutionStatus::Running,
                input: input.clone(),
                root: BranchState::new(BranchPath::root(), "Mark", input, now),
                output: None,
                error: None,
                started_at: now,
                updated_at: now,
                completed_at: None,
            })
            .unwrap();
    }

    let (orchestrator, _) = open(&path, ExecutorRegistry::new());
    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.resumed, 1);
    orchestrator.settle(id).await;

    let execution = orchestrator.get_execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.output, Some(json!({"n": 1, "marked": true})));
}

#[tokio::test]
async fn test_orphaned_callback_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    let orphan = {
        let (orchestrator, _) = open(&path, humans());
        start(&orchestrator, APPROVAL, json!({})).await;
        let mut orphan = orchestrator.callbacks().pending()[0].clone();
        orphan.token = "orphan-token".to_string();
        orphan.execution_id = Uuid::new_v4();
        orchestrator.store().put_callback(&orphan).unwrap();
        orphan
    };

    let (orchestrator, _) = open(&path, humans());
    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.discarded, 1);
    assert!(!orchestrator.callbacks().is_pending(&orphan.token));
    assert_eq!(orchestrator.callbacks().pending().len(), 1);

    let stored = orchestrator.store().get_callback(&orphan.token).unwrap().unwrap();
    assert_eq!(stored.status, CallbackStatus::Discarded);
}

#[tokio::test]
async fn test_stop_discards_tokens_and_fails_execution() {
    let executors = ExecutorRegistry::new();
    executors.register("human", accepting_callbacks());
    let harness = Harness::new(executors);
    let id = harness.run(APPROVAL, json!({})).await;
    let token = harness.only_token();

    let stopped = harness
        .orchestrator
        .stop_execution(id, Some("operator cancelled".to_string()))
        .await
        .unwrap();
    assert_eq!(stopped.status, ExecutionStatus::Failed);
    let error = stopped.error.clone().unwrap();
    assert_eq!(error.error, "ExecutionStopped");
    assert_eq!(error.cause, "operator cancelled");

    assert!(harness.orchestrator.callbacks().pending().is_empty());
    assert_eq!(harness.orchestrator.pending_timers(), 0);
    let stored = harness.store.get_callback(&token).unwrap().unwrap();
    assert_eq!(stored.status, CallbackStatus::Discarded);

    let late = harness
        .orchestrator
        .complete_task(&token, CallbackOutcome::Success(json!("too late")));
    assert!(matches!(
        late,
        Err(OrchestratorError::Callback(CallbackError::AlreadyResolved(_)))
    ));

    // Stopping again is a no-op
    let again = harness.orchestrator.stop_execution(id, None).await.unwrap();
    assert_eq!(again.error, stopped.error);

    let history = harness.orchestrator.history(id).unwrap();
    assert_eq!(history.last().map(|r| r.kind), Some(TransitionKind::Failed));
    let replayed = replay(&history).unwrap();
    assert_eq!(replayed.status, ExecutionStatus::Failed);
    assert_eq!(replayed.error, stopped.error);
}

#[tokio::test]
async fn test_replay_matches_final_state() {
    let executors = ExecutorRegistry::new();
    executors.register(
        "double",
        Arc::new(FnExecutor::sync(|input| async move {
            Ok(json!(input.payload.as_i64().unwrap_or_default() * 2))
        })),
    );
    let harness = Harness::new(executors);

    let id = harness
        .run(
            r#"
name: replayable
start_at: Seed
states:
  - {type: pass, name: Seed, result: 21, result_path: $.value, next: Both}
  - type: parallel
    name: Both
    branches:
      - start_at: Double
        states:
          - {type: task, name: Double, resource: double, input_path: $.value, end: true}
      - start_at: Keep
        states:
          - {type: pass, name: Keep, expression: $.value, end: true}
    result_path: $.results
    next: Check
  - type: choice
    name: Check
    choices:
      - {condition: "$.value == 21", next: Nap}
    default: Wrong
  - {type: wait, name: Nap, seconds: 1, next: Done}
  - {type: succeed, name: Done}
  - {type: fail, name: Wrong, error: Unexpected}
"#,
            json!({}),
        )
        .await;
    harness.advance(id, Duration::from_secs(1)).await;

    let execution = harness.execution(id);
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(
        execution.output,
        Some(json!({"value": 21, "results": [42, 21]}))
    );

    let history = harness.orchestrator.history(id).unwrap();
    let replayed = replay(&history).unwrap();
    assert_eq!(replayed.execution_id, id);
    assert_eq!(replayed.status, execution.status);
    assert_eq!(replayed.current_state, execution.current_state());
    assert_eq!(Some(replayed.document), execution.output);
    assert_eq!(replayed.records, history.len());
}
