//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for execution records and event histories
//! - [`InMemoryWorkflowEventStore`] for testing
//! - [`FileWorkflowEventStore`] for durable storage on local disk

mod file;
mod ledger;
mod memory;
mod store;

pub use file::FileWorkflowEventStore;
pub use memory::InMemoryWorkflowEventStore;
pub use store::{
    ConflictError, ExecutionId, ExecutionUpdate, ParentLink, StoreError, WorkflowEventStore,
    WorkflowExecution, WorkflowStatus,
};
