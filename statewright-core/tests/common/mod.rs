//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use serde_json::Value;
use statewright_core::models::{Execution, StateMachineDefinition};
use statewright_core::workflow::{
    EngineSettings, ExecutionStore, ExecutorRegistry, ManualClock, MemoryStore, Orchestrator,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub fn definition(yaml: &str) -> StateMachineDefinition {
    StateMachineDefinition::from_yaml(yaml).expect("test definition should parse")
}

/// Orchestrator over an in-memory store with simulated time
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub clock: ManualClock,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new(executors: ExecutorRegistry) -> Self {
        Self::with_store(executors, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(executors: ExecutorRegistry, store: Arc<MemoryStore>) -> Self {
        Self::build(executors, store, Self::settings())
    }

    pub fn with_settings(executors: ExecutorRegistry, settings: EngineSettings) -> Self {
        Self::build(executors, Arc::new(MemoryStore::new()), settings)
    }

    /// One-hour callback timeout and a one-minute backoff cap
    pub fn settings() -> EngineSettings {
        EngineSettings {
            default_callback_timeout: Duration::from_secs(3600),
            max_backoff: Some(Duration::from_secs(60)),
            ..EngineSettings::default()
        }
    }

    fn build(executors: ExecutorRegistry, store: Arc<MemoryStore>, settings: EngineSettings) -> Self {
        let clock = ManualClock::new();
        let orchestrator = Orchestrator::new(
            store.clone() as Arc<dyn ExecutionStore>,
            executors,
            Arc::new(clock.clone()),
            settings,
        )
        .expect("orchestrator should build");
        Self {
            orchestrator,
            clock,
            store,
        }
    }

    /// Register `yaml`, start it and wait until the first drive settles
    pub async fn run(&self, yaml: &str, input: Value) -> Uuid {
        let definition = definition(yaml);
        let name = definition.name.clone();
        self.orchestrator
            .register_definition(definition)
            .expect("definition should compile");
        let id = self
            .orchestrator
            .start_execution(&name, input)
            .expect("execution should start");
        self.orchestrator.settle(id).await;
        id
    }

    /// Move simulated time forward and process whatever came due
    pub async fn advance(&self, id: Uuid, by: Duration) -> usize {
        self.clock.advance(by);
        let fired = self.orchestrator.fire_due_timers();
        self.orchestrator.settle(id).await;
        fired
    }

    pub fn execution(&self, id: Uuid) -> Execution {
        self.orchestrator
            .get_execution(id)
            .expect("execution should exist")
    }

    /// The single task token currently pending
    pub fn only_token(&self) -> String {
        let pending = self.orchestrator.callbacks().pending();
        assert_eq!(pending.len(), 1, "expected exactly one pending callback");
        pending[0].token.clone()
    }
}

/// Executor accepting callback dispatches without doing anything
pub fn accepting_callbacks() -> Arc<statewright_core::workflow::FnExecutor> {
    Arc::new(statewright_core::workflow::FnExecutor::callback(
        |_, _| async { Ok(()) },
    ))
}
