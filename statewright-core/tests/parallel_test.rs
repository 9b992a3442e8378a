//! Parallel fork/join: ordering, failure propagation and catch

mod common;

use common::{accepting_callbacks, Harness};
use rand::Rng;
use serde_json::{json, Value};
use statewright_core::models::{CallbackStatus, ExecutionStatus, TransitionKind};
use statewright_core::workflow::{
    CallbackError, CallbackOutcome, ExecutionStore, ExecutorRegistry, FnExecutor,
    OrchestratorError, TaskError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Parallel state with one `sleepy` task per branch, each told its index
fn fan_out(name: &str, width: usize) -> String {
    let branches: Vec<Value> = (0..width)
        .map(|index| {
            json!({
                "start_at": "Work",
                "states": [{
                    "type": "task",
                    "name": "Work",
                    "resource": "sleepy",
                    "parameters": {"index": index},
                    "end": true
                }]
            })
        })
        .collect();

    json!({
        "name": name,
        "start_at": "Fork",
        "states": [
            {"type": "parallel", "name": "Fork", "branches": branches, "result_path": "$.results", "end": true}
        ]
    })
    .to_string()
}

fn sleepy_executors() -> ExecutorRegistry {
    let executors = ExecutorRegistry::new();
    executors.register(
        "sleepy",
        Arc::new(FnExecutor::sync(|input| async move {
            let delay = rand::thread_rng().gen_range(0..25);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(input.payload["index"].clone())
        })),
    );
    executors
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_outputs_follow_declaration_order() {
    let harness = Harness::new(sleepy_executors());

    for iteration in 0..5 {
        let width = 6;
        let id = harness
            .run(&fan_out(&format!("fan-{}", iteration), width), json!({"seed": iteration}))
            .await;

        let execution = harness.execution(id);
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        let expected: Vec<Value> = (0..width).map(|index| json!(index)).collect();
        assert_eq!(
            execution.output,
            Some(json!({"seed": iteration, "results": expected}))
        );
    }
}

#[tokio::test]
async fn test_branch_failure_cancels_waiting_sibling() {
    let harness = Harness::new(ExecutorRegistry::new());
    let seen_tokens = Arc::new(Mutex::new(Vec::new()));

    let executors = harness.orchestrator.executors();
    executors.register("human", accepting_callbacks());
    let callbacks = harness.orchestrator.callbacks().clone();
    let seen = seen_tokens.clone();
    executors.register(
        "broken",
        Arc::new(FnExecutor::sync(move |_| {
            let callbacks = callbacks.clone();
            let seen = seen.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                seen.lock()
                    .unwrap()
                    .extend(callbacks.pending().into_iter().map(|callback| callback.token));
                Err(TaskError::new("Exploded", "branch blew up"))
            }
        })),
    );

    let id = harness
        .run(
            r#"
name: doomed
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
    end: true
"#,
            json!({}),
        )
        .await;

    let execution = harness.execution(id);
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.unwrap().error, "Exploded");
    assert!(harness.orchestrator.callbacks().pending().is_empty());

    let tokens = seen_tokens.lock().unwrap().clone();
    assert_eq!(tokens.len(), 1);
    let stored = harness.store.get_callback(&tokens[0]).unwrap().unwrap();
    assert_eq!(stored.status, CallbackStatus::Discarded);

    let late = harness
        .orchestrator
        .complete_task(&tokens[0], CallbackOutcome::Success(json!("too late")));
    assert!(matches!(
        late,
        Err(OrchestratorError::Callback(CallbackError::AlreadyResolved(_)))
    ));
    assert_eq!(harness.execution(id).status, ExecutionStatus::Failed);

    let history = harness.orchestrator.history(id).unwrap();
    assert!(history
        .iter()
        .any(|record| record.kind == TransitionKind::Cancelled && !record.branch.is_root()));
}

#[tokio::test]
async fn test_parallel_failure_is_catchable() {
    let executors = ExecutorRegistry::new();
    executors.register(
        "ok",
        Arc::new(FnExecutor::sync(|_| async { Ok(json!("fine")) })),
    );
    executors.register(
        "broken",
        Arc::new(FnExecutor::sync(|_| async {
            Err(TaskError::new("Exploded", "branch blew up"))
        })),
    );
    let harness = Harness::new(executors);

    let id = harness
        .run(
            r#"
name: guarded
start_at: Fork
states:
  - type: parallel
    name: Fork
    branches:
      - start_at: Fine
        states:
          - {type: task, name: Fine, resource: ok, end: true}
      - start_at: Break
        states:
          - {type: task, name: Break, resource: broken, end: true}
    result_path: $.results
    catch:
      - {errors: [Exploded], next: Cleanup, result_path: $.problem}
    end: true
  - {type: pass, name: Cleanup, end: true}
"#,
            json!({"job": 1}),
        )
        .await;

    let execution = harness.execution(id);
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.current_state(), "Cleanup");
    assert_eq!(
        execution.output,
        Some(json!({
            "job": 1,
            "problem": {"error": "Exploded", "cause": "branch blew up"}
        }))
    );
}

#[tokio::test]
async fn test_nested_parallel_with_wait_branch() {
    let harness = Harness::new(ExecutorRegistry::new());

    let id = harness
        .run(
            r#"
name: nested
start_at: Outer
states:
  - type: parallel
    name: Outer
    branches:
      - start_at: Inner
        states:
          - type: parallel
            name: Inner
            branches:
              - start_at: Nap
                states:
                  - {type: wait, name: Nap, seconds: 5, next: Woke}
                  - {type: pass, name: Woke, result: awake, end: true}
              - start_at: Now
                states:
                  - {type: pass, name: Now, result: now, end: true}
            end: true
      - start_at: Plain
        states:
          - {type: pass, name: Plain, result: plain, end: true}
    end: true
"#,
            json!({}),
        )
        .await;

    assert_eq!(harness.execution(id).status, ExecutionStatus::Suspended);
    assert_eq!(harness.advance(id, Duration::from_secs(5)).await, 1);

    let execution = harness.execution(id);
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.output, Some(json!([["awake", "now"], "plain"])));
}
