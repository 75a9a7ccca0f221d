//! # Durable Execution Engine
//!
//! An event-sourced workflow engine with at-least-once activity retry,
//! child-workflow composition and typed failure propagation.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: every state change is an event in an append-only history; workflow state is rebuilt by replay
//! - **Determinism checks**: replayed commands are matched against the history, divergence is reported instead of executed
//! - **Automatic retries**: exponential or scheduled backoff, non-retryable errors fail on the first attempt
//! - **Child workflows**: failures cross each boundary wrapped exactly once
//! - **Crash recovery**: the file store survives restarts and [`Engine::recover`] rebuilds the task queues
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Client / WorkflowHandle                      │
//! │  (start, cancel, terminate, wait for result)                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │  (tick locks, task queues, child coordinator, recovery)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (in-memory or JSON-lines files: records, histories)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                              │
//! │  (WorkflowExecutor ticks, ActivityInvoker attempts)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use keel_durable::prelude::*;
//!
//! struct GreetingWorkflow {
//!     name: String,
//! }
//!
//! impl Workflow for GreetingWorkflow {
//!     const TYPE: &'static str = "greeting_workflow";
//!     type Input = String;
//!     type Output = String;
//!
//!     fn new(name: Self::Input) -> Self {
//!         Self { name }
//!     }
//!
//!     fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
//!         Ok(vec![WorkflowAction::schedule_activity(
//!             "compose",
//!             "compose_greeting",
//!             json!(self.name),
//!         )])
//!     }
//!
//!     fn on_activity_resolved(
//!         &mut self,
//!         _ctx: &mut WorkflowContext,
//!         _activity_id: &str,
//!         result: Result<Value, Failure>,
//!     ) -> WorkflowStep {
//!         Ok(vec![WorkflowAction::complete(result?)])
//!     }
//! }
//!
//! let engine = Arc::new(Engine::new(Arc::new(InMemoryWorkflowEventStore::new())));
//! let mut worker = Worker::new(engine.clone(), WorkerConfig::new("default"));
//! worker.register_workflow::<GreetingWorkflow>().register_activity(ComposeGreeting);
//! worker.start()?;
//!
//! let greeting = Client::new(engine)
//!     .execute_workflow::<GreetingWorkflow>("World".into(), StartWorkflowOptions::new())
//!     .await?;
//! ```

pub mod activity;
pub mod client;
pub mod config;
pub mod engine;
pub mod failure;
pub mod persistence;
pub mod reliability;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::client::{
        Client, ClientError, StartWorkflowOptions, WorkflowFailureError, WorkflowHandle,
    };
    pub use crate::config::EngineSettings;
    pub use crate::engine::{Engine, EngineError, ExecutorConfig, ExecutorError, WorkflowExecutor};
    pub use crate::failure::{Failure, FailureKind, RetryState, TimeoutType};
    pub use crate::persistence::{
        ExecutionId, FileWorkflowEventStore, InMemoryWorkflowEventStore, StoreError,
        WorkflowEventStore, WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{Worker, WorkerConfig, WorkerError};
    pub use crate::workflow::{
        decode, encode, ActivityOptions, ChildWorkflowOptions, Workflow, WorkflowAction,
        WorkflowContext, WorkflowStep,
    };
    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError};
pub use client::{Client, ClientError, StartWorkflowOptions, WorkflowFailureError, WorkflowHandle};
pub use engine::{Engine, EngineError, ExecutorConfig, ExecutorError, WorkflowExecutor, WorkflowRegistry};
pub use failure::{Failure, FailureKind};
pub use persistence::{
    ExecutionId, FileWorkflowEventStore, InMemoryWorkflowEventStore, StoreError,
    WorkflowEventStore, WorkflowStatus,
};
pub use reliability::RetryPolicy;
pub use worker::{Worker, WorkerConfig, WorkerError};
pub use workflow::{ActivityOptions, Workflow, WorkflowAction, WorkflowContext, WorkflowStep};
