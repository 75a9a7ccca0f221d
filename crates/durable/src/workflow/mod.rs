//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`WorkflowAction`] enum for workflow commands
//! - [`EventKind`] enum for persisted events
//! - [`WorkflowContext`] for deterministic time, randomness and replay state

mod action;
mod context;
mod definition;
mod event;

pub use action::{ActivityOptions, ChildWorkflowOptions, WorkflowAction};
pub use context::WorkflowContext;
pub use definition::{decode, encode, Workflow, WorkflowStep};
pub use event::{Event, EventKind, NewEvent};
