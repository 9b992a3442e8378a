//! Progress visibility while a drive is still running, runaway loops and
//! cleanup of finished executions

mod common;

use common::{accepting_callbacks, Harness};
use serde_json::json;
use statewright_core::models::{error_codes, ExecutionStatus, Suspension, TransitionKind};
use statewright_core::workflow::{
    CallbackOutcome, EngineSettings, ExecutorRegistry, FnExecutor, TaskError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const ENDLESS: &str = r#"
name: endless
start_at: Count
states:
  - {type: pass, name: Count, expression: "$.count + 1", result_path: $.count, next: Check}
  - type: choice
    name: Check
    choices:
      - {condition: "$.count < 0", next: Done}
    default: Count
  - {type: succeed, name: Done}
"#;

/// Sync executor that reports when it starts and then waits for `gate`
fn gated(started: Arc<Notify>, gate: Arc<Notify>) -> Arc<FnExecutor> {
    Arc::new(FnExecutor::sync(move |_| {
        let started = started.clone();
        let gate = gate.clone();
        async move {
            started.notify_one();
            gate.notified().await;
            Ok(json!("released"))
        }
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_steps_visible_while_task_runs() {
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let executors = ExecutorRegistry::new();
    executors.register("gated", gated(started.clone(), gate.clone()));
    let harness = Harness::new(executors);

    harness
        .orchestrator
        .register_definition(common::definition(
            r#"
name: visible
start_at: A
states:
  - {type: pass, name: A, result: 1, result_path: $.a, next: B}
  - {type: pass, name: B, result: 2, result_path: $.b, next: T}
  - {type: task, name: T, resource: gated, result_path: $.t, end: true}
"#,
        ))
        .unwrap();
    let id = harness
        .orchestrator
        .start_execution("visible", json!({}))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("task should start");

    let execution = harness.execution(id);
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.current_state(), "T");
    assert_eq!(execution.document(), &json!({"a": 1, "b": 2}));
    let kinds: Vec<TransitionKind> = harness
        .orchestrator
        .history(id)
        .unwrap()
        .iter()
        .map(|record| record.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            TransitionKind::Started,
            TransitionKind::Transition,
            TransitionKind::Transition
        ]
    );

    gate.notify_one();
    let execution = harness
        .orchestrator
        .wait_for_completion(id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(
        execution.output,
        Some(json!({"a": 1, "b": 2, "t": "released"}))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_callback_dispatched_while_sibling_runs() {
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let dispatched = Arc::new(Notify::new());
    let executors = ExecutorRegistry::new();
    executors.register("gated", gated(started.clone(), gate.clone()));
    {
        let dispatched = dispatched.clone();
        executors.register(
            "human",
            Arc::new(FnExecutor::callback(move |_, _| {
                let dispatched = dispatched.clone();
                async move {
                    dispatched.notify_one();
                    Ok(())
                }
            })),
        );
    }
    let harness = Harness::new(executors);

    harness
        .orchestrator
        .register_definition(common::definition(
            r#"
name: side-by-side
start_at: Fork
states:
  - type: parallel
    name: Fork
    branches:
      - start_at: Compute
        states:
          - {type: task, name: Compute, resource: gated, end: true}
      - start_at: Ask
        states:
          - {type: task, name: Ask, resource: human, mode: callback, end: true}
    result_path: $.results
    end: true
"#,
        ))
        .unwrap();
    let id = harness
        .orchestrator
        .start_execution("side-by-side", json!({}))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("compute branch should start");
    tokio::time::timeout(Duration::from_secs(5), dispatched.notified())
        .await
        .expect("callback should be dispatched before the sibling finishes");

    let execution = harness.execution(id);
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert!(matches!(
        execution.root.branches[1].suspension,
        Some(Suspension::Callback { .. })
    ));

    let token = harness.only_token();
    harness
        .orchestrator
        .complete_task(&token, CallbackOutcome::Success(json!("approved")))
        .unwrap();
    gate.notify_one();

    let execution = harness
        .orchestrator
        .wait_for_completion(id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(
        execution.output,
        Some(json!({"results": ["released", "approved"]}))
    );
}

#[tokio::test]
async fn test_endless_loop_hits_step_limit() {
    let harness = Harness::with_settings(
        ExecutorRegistry::new(),
        EngineSettings {
            max_transitions: 100,
            ..Harness::settings()
        },
    );
    let id = harness.run(ENDLESS, json!({"count": 0})).await;

    let execution = harness.execution(id);
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        execution.error.unwrap().error,
        error_codes::TRANSITION_LIMIT_EXCEEDED
    );
    assert_eq!(harness.orchestrator.tracked_executions(), 0);
}

#[tokio::test]
async fn test_endless_loop_can_be_stopped() {
    let harness = Harness::with_settings(
        ExecutorRegistry::new(),
        EngineSettings {
            max_transitions: u64::MAX,
            ..Harness::settings()
        },
    );
    harness
        .orchestrator
        .register_definition(common::definition(ENDLESS))
        .unwrap();
    let id = harness
        .orchestrator
        .start_execution("endless", json!({"count": 0}))
        .unwrap();

    // Single-threaded runtime: this only resumes if the loop yields
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.execution(id).status, ExecutionStatus::Running);

    let stopped = tokio::time::timeout(
        Duration::from_secs(10),
        harness
            .orchestrator
            .stop_execution(id, Some("runaway".to_string())),
    )
    .await
    .expect("stop should not wait on the loop forever")
    .unwrap();
    assert_eq!(stopped.status, ExecutionStatus::Failed);
    let error = stopped.error.unwrap();
    assert_eq!(error.error, error_codes::EXECUTION_STOPPED);
    assert_eq!(error.cause, "runaway");
}

#[tokio::test]
async fn test_finished_execution_releases_bookkeeping() {
    let executors = ExecutorRegistry::new();
    executors.register("human", accepting_callbacks());
    executors.register(
        "quick",
        Arc::new(FnExecutor::sync(|_| async { Ok(json!("ok")) })),
    );
    let harness = Harness::new(executors);

    let id = harness
        .run(
            r#"
name: quick
start_at: Work
states:
  - {type: task, name: Work, resource: quick, end: true}
"#,
            json!({}),
        )
        .await;
    assert_eq!(harness.execution(id).status, ExecutionStatus::Succeeded);
    assert_eq!(harness.orchestrator.tracked_executions(), 0);

    let id = harness
        .run(
            r#"
name: asked
start_at: Ask
states:
  - {type: task, name: Ask, resource: human, mode: callback, end: true}
"#,
            json!({}),
        )
        .await;
    assert_eq!(harness.orchestrator.pending_timers(), 1);
    harness
        .orchestrator
        .stop_execution(id, None)
        .await
        .unwrap();
    harness.orchestrator.settle(id).await;
    assert_eq!(harness.orchestrator.pending_timers(), 0);
    assert_eq!(harness.orchestrator.tracked_executions(), 0);
}

#[tokio::test]
async fn test_discarded_sibling_drops_its_timeout() {
    let executors = ExecutorRegistry::new();
    executors.register("human", accepting_callbacks());
    executors.register(
        "broken",
        Arc::new(FnExecutor::sync(|_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(TaskError::new("Exploded", "branch blew up"))
        })),
    );
    let harness = Harness::new(executors);

    let id = harness
        .run(
            r#"
name: recovered
start_at: Fork
states:
  - type: parallel
    name: Fork
    branches:
      - start_at: Ask
        states:
          - {type: task, name: Ask, resource: human, mode: callback, end: true}
      - start_at: Break
        states:
          - {type: task, name: Break, resource: broken, end: true}
    catch:
      - {errors: [Exploded], next: Pause}
    end: true
  - {type: wait, name: Pause, seconds: 60, next: Done}
  - {type: succeed, name: Done}
"#,
            json!({}),
        )
        .await;

    let execution = harness.execution(id);
    assert_eq!(execution.status, ExecutionStatus::Suspended);
    assert_eq!(execution.current_state(), "Pause");
    assert!(harness.orchestrator.callbacks().pending().is_empty());
    // Only the wait remains armed
    assert_eq!(harness.orchestrator.pending_timers(), 1);

    harness.advance(id, Duration::from_secs(60)).await;
    assert_eq!(harness.execution(id).status, ExecutionStatus::Succeeded);
    assert_eq!(harness.orchestrator.pending_timers(), 0);
    assert_eq!(harness.orchestrator.tracked_executions(), 0);
}
