//! Bookkeeping shared by the store implementations
//!
//! The ledger validates and applies changes in memory. Stores wrap it in a
//! lock and, for the file store, write each change to disk between the
//! validation and the commit.

use std::collections::{HashMap, HashSet};

use super::store::{ConflictError, ExecutionId, StoreError, WorkflowExecution, WorkflowStatus};
use crate::workflow::{Event, NewEvent};

struct ExecutionState {
    execution: WorkflowExecution,
    events: Vec<Event>,
    event_ids: HashSet<String>,
}

#[derive(Default)]
pub(crate) struct Ledger {
    executions: HashMap<ExecutionId, ExecutionState>,
    /// Run ids per workflow id, oldest first
    runs: HashMap<String, Vec<ExecutionId>>,
}

impl Ledger {
    pub(crate) fn check_create(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        if self.executions.contains_key(&execution.id) {
            return Err(StoreError::AlreadyExists(execution.id.clone()));
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, execution: WorkflowExecution, events: Vec<Event>) {
        let id = execution.id.clone();
        let event_ids = events.iter().map(|e| e.event_id.clone()).collect();
        self.runs
            .entry(id.workflow_id.clone())
            .or_default()
            .push(id.clone());
        self.executions.insert(
            id,
            ExecutionState {
                execution,
                events,
                event_ids,
            },
        );
    }

    pub(crate) fn get(&self, id: &ExecutionId) -> Result<&WorkflowExecution, StoreError> {
        self.state(id).map(|s| &s.execution)
    }

    pub(crate) fn latest_run(&self, workflow_id: &str) -> Option<&WorkflowExecution> {
        self.runs
            .get(workflow_id)
            .and_then(|runs| runs.last())
            .and_then(|id| self.executions.get(id))
            .map(|s| &s.execution)
    }

    pub(crate) fn list(&self, status: Option<WorkflowStatus>) -> Vec<WorkflowExecution> {
        let mut executions: Vec<_> = self
            .executions
            .values()
            .map(|s| &s.execution)
            .filter(|e| status.map_or(true, |status| e.status == status))
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.created_at);
        executions
    }

    pub(crate) fn events(&self, id: &ExecutionId) -> Result<&[Event], StoreError> {
        self.state(id).map(|s| s.events.as_slice())
    }

    /// Validate an append and build the event it would store
    pub(crate) fn check_append(
        &self,
        id: &ExecutionId,
        expected_sequence: u64,
        event: NewEvent,
    ) -> Result<Event, StoreError> {
        let state = self.state(id)?;
        let actual = state.events.len() as u64;
        if expected_sequence != actual {
            return Err(ConflictError::SequenceMismatch {
                expected: expected_sequence,
                actual,
            }
            .into());
        }
        if state.event_ids.contains(&event.event_id) {
            return Err(ConflictError::DuplicateEvent {
                event_id: event.event_id,
            }
            .into());
        }
        Ok(event.into_event(actual))
    }

    /// Commit an event returned by [`Ledger::check_append`]
    pub(crate) fn commit_append(&mut self, id: &ExecutionId, event: Event) -> Result<u64, StoreError> {
        let state = self.state_mut(id)?;
        let sequence = event.sequence;
        state.event_ids.insert(event.event_id.clone());
        state.events.push(event);
        Ok(sequence)
    }

    pub(crate) fn replace(&mut self, execution: WorkflowExecution) -> Result<(), StoreError> {
        let state = self.state_mut(&execution.id)?;
        state.execution = execution;
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.executions.len()
    }

    fn state(&self, id: &ExecutionId) -> Result<&ExecutionState, StoreError> {
        self.executions
            .get(id)
            .ok_or_else(|| StoreError::ExecutionNotFound(id.clone()))
    }

    fn state_mut(&mut self, id: &ExecutionId) -> Result<&mut ExecutionState, StoreError> {
        self.executions
            .get_mut(id)
            .ok_or_else(|| StoreError::ExecutionNotFound(id.clone()))
    }
}
