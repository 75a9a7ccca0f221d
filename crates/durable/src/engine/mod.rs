//! Workflow execution engine
//!
//! - [`Engine`] owns the store, the task queues and the per-execution locks
//! - [`WorkflowExecutor`] runs ticks: replay, record new commands, dispatch
//! - [`replay_history`] is the pure replay step
//! - [`ChildWorkflowCoordinator`] links parents and children

mod coordinator;
mod core;
mod executor;
mod registry;
mod replay;

pub use self::core::{Engine, EngineError, NewRun, RecoveryReport};
pub use coordinator::{child_execution_id, ChildStart, ChildWorkflowCoordinator};
pub use executor::{ExecutorConfig, ExecutorError, ProcessResult, WorkflowExecutor};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
pub use replay::{replay_history, ReplayOutcome};
