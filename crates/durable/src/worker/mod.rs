//! Task queues and workers
//!
//! This module provides:
//! - [`TaskQueues`] - In-memory named queues of workflow and activity tasks
//! - [`Worker`] - Runs workflow ticks and activity attempts for one queue
//! - [`PollerConfig`] - Task polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                              │
//! │  ┌──────────────────────┐   ┌────────────────────────────┐  │
//! │  │    Workflow loop     │   │       Activity loop        │  │
//! │  │ (TaskPoller, ticks)  │   │ (TaskPoller, expiry sweep) │  │
//! │  └──────────┬───────────┘   └─────────────┬──────────────┘  │
//! │             │                             │                  │
//! │             ▼                             ▼                  │
//! │  ┌──────────────────────┐   ┌────────────────────────────┐  │
//! │  │   WorkflowExecutor   │   │ Attempts (Semaphore-bound) │  │
//! │  │                      │   │ [1] [2] [3] ... [N]        │  │
//! │  └──────────────────────┘   └────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use keel_durable::worker::{Worker, WorkerConfig};
//!
//! let mut worker = Worker::new(engine, WorkerConfig::new("default").with_max_concurrent_activities(20));
//! worker
//!     .register_workflow::<GreetingWorkflow>()
//!     .register_activity(ComposeGreeting);
//!
//! worker.start()?;
//!
//! // Graceful shutdown
//! worker.shutdown().await?;
//! ```

mod poller;
mod pool;
mod queue;

pub use poller::{PollerConfig, TaskPoller};
pub use pool::{Worker, WorkerConfig, WorkerError, WorkerStatus};
pub use queue::{TaskQueues, WorkflowTask};
