//! Workflow compilation, execution and durability

pub mod callback_registry;
pub mod command_executor;
pub mod compiler;
pub mod engine;
pub mod executor;
pub mod machine;
pub mod orchestrator;
pub mod persistence;
pub mod replay;
pub mod retry;
pub mod timer;

pub use callback_registry::{CallbackError, CallbackOutcome, CallbackRegistry};
pub use command_executor::CommandExecutor;
pub use compiler::{compile, CompileError};
pub use engine::{Engine, EngineSettings};
pub use executor::{ExecutorRegistry, FnExecutor, TaskError, TaskExecutor, TaskInput};
pub use machine::StateMachine;
pub use orchestrator::{Orchestrator, OrchestratorError, RecoveryReport};
pub use persistence::{ExecutionStore, JsonFileStore, MemoryStore};
pub use replay::{replay, ReplayError, ReplayedExecution};
pub use timer::{Clock, ManualClock, SystemClock};
