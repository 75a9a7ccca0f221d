//! Deterministic replay of an execution history
//!
//! Replay feeds a fresh workflow instance every event of its history, in
//! order, and collects the commands the code issues. Commands already
//! recorded in the history must match what the code issues now; whatever is
//! left over is new work for the current tick.
//!
//! Replay is a pure function of the history: it never touches the store,
//! the clock, or the task queues.

use std::collections::HashMap;

use uuid::Uuid;

use super::coordinator::child_execution_id;
use super::executor::ExecutorError;
use super::registry::AnyWorkflow;
use crate::failure::{wrap_across_boundary, Boundary, Failure, RetryState};
use crate::persistence::ExecutionId;
use crate::reliability::RetryDecision;
use crate::workflow::{Event, EventKind, WorkflowAction, WorkflowContext, WorkflowStep};

/// What a replay produced
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    /// Commands issued by the code that are not in the history yet, in issue order
    pub commands: Vec<WorkflowAction>,

    /// Started children whose waits were cancelled by events newer than the cursor
    pub children_to_cancel: Vec<ExecutionId>,

    /// Sequence of the last event applied
    pub last_sequence: Option<u64>,
}

impl ReplayOutcome {
    /// The terminal command, if the code closed the workflow
    pub fn terminal(&self) -> Option<&WorkflowAction> {
        self.commands.iter().find(|c| c.is_terminal())
    }
}

/// Replay `history` through `workflow`
///
/// `replay_cursor` is the last sequence applied by a previous tick; events
/// up to it are reported to the code as replaying. Any command issued while
/// applying such an event must already be recorded, because the tick that
/// applied it recorded everything it issued.
///
/// # Errors
///
/// [`ExecutorError::NonDeterminism`] when recorded commands and re-issued
/// commands disagree, [`ExecutorError::CorruptHistory`] when the history is
/// not a valid log.
pub fn replay_history(
    workflow: &mut dyn AnyWorkflow,
    execution: &ExecutionId,
    history: &[Event],
    replay_cursor: Option<u64>,
) -> Result<ReplayOutcome, ExecutorError> {
    let mut replayer = Replayer::new(workflow, execution);

    for (index, event) in history.iter().enumerate() {
        if event.sequence != index as u64 {
            return Err(ExecutorError::CorruptHistory(format!(
                "event {} has sequence {}",
                index, event.sequence
            )));
        }
        if index == 0 && !matches!(event.kind, EventKind::WorkflowStarted { .. }) {
            return Err(ExecutorError::CorruptHistory(
                "history does not begin with WorkflowStarted".to_string(),
            ));
        }

        let replaying = replay_cursor.is_some_and(|cursor| event.sequence <= cursor);
        replayer.ctx.advance(event.timestamp, replaying);
        replayer.apply(event, replaying)?;
    }

    let last_sequence = history.last().map(|e| e.sequence);
    replayer.finish(replay_cursor, last_sequence)
}

#[derive(Debug, Clone)]
struct ChildRef {
    workflow_id: String,
    run_id: Uuid,
    workflow_type: String,
}

impl ChildRef {
    fn execution(&self) -> ExecutionId {
        ExecutionId::new(self.workflow_id.clone(), self.run_id)
    }
}

struct Pending {
    action: WorkflowAction,
    issued_at: u64,
}

struct Replayer<'a> {
    workflow: &'a mut dyn AnyWorkflow,
    ctx: WorkflowContext,
    execution: ExecutionId,

    /// Activity type of every activity the code scheduled
    activities: HashMap<String, String>,
    /// Failed attempts seen so far per activity
    attempts: HashMap<String, u32>,
    /// Activities still awaiting a resolution, in issue order
    open_activities: Vec<String>,

    children: HashMap<String, ChildRef>,
    /// Children whose start is recorded in the history
    recorded_children: Vec<String>,
    open_children: Vec<String>,

    /// Issued commands not matched by a history event yet
    pending: Vec<Pending>,
    children_to_cancel: Vec<ExecutionId>,

    /// The code issued a terminal command
    closed: bool,
    /// The history closed the run without workflow code
    terminated: bool,
}

impl<'a> Replayer<'a> {
    fn new(workflow: &'a mut dyn AnyWorkflow, execution: &ExecutionId) -> Self {
        let ctx = WorkflowContext::new(execution.clone(), workflow.workflow_type());
        Self {
            workflow,
            ctx,
            execution: execution.clone(),
            activities: HashMap::new(),
            attempts: HashMap::new(),
            open_activities: Vec::new(),
            children: HashMap::new(),
            recorded_children: Vec::new(),
            open_children: Vec::new(),
            pending: Vec::new(),
            children_to_cancel: Vec::new(),
            closed: false,
            terminated: false,
        }
    }

    fn apply(&mut self, event: &Event, replaying: bool) -> Result<(), ExecutorError> {
        let seq = event.sequence;

        if self.terminated {
            return Err(ExecutorError::CorruptHistory(format!(
                "event {} follows WorkflowTerminated",
                seq
            )));
        }

        match &event.kind {
            EventKind::WorkflowStarted { .. } => {
                if seq != 0 {
                    return Err(ExecutorError::CorruptHistory(format!(
                        "WorkflowStarted at sequence {}",
                        seq
                    )));
                }
                let step = self.workflow.on_start(&mut self.ctx);
                self.absorb(step, seq);
            }

            EventKind::ActivityScheduled {
                activity_id,
                activity_type,
                ..
            } => {
                let index = self.find_pending(seq, |action| {
                    matches!(action, WorkflowAction::ScheduleActivity { activity_id: id, .. } if id == activity_id)
                })?;
                if let WorkflowAction::ScheduleActivity {
                    activity_type: issued,
                    ..
                } = &self.pending[index].action
                {
                    if issued != activity_type {
                        return Err(ExecutorError::NonDeterminism(format!(
                            "activity {} was scheduled as {} but the workflow now schedules {}",
                            activity_id, activity_type, issued
                        )));
                    }
                }
                self.pending.remove(index);
            }

            EventKind::ActivityCompleted {
                activity_id,
                result,
                ..
            } => {
                if self.closed {
                    return Ok(());
                }
                self.require_activity(activity_id, seq)?;
                if take(&mut self.open_activities, activity_id) {
                    let step =
                        self.workflow
                            .on_activity_resolved(&mut self.ctx, activity_id, Ok(result.clone()));
                    self.absorb(step, seq);
                }
            }

            EventKind::ActivityFailed {
                activity_id,
                attempt,
                failure,
                decision,
            } => {
                if self.closed {
                    return Ok(());
                }
                self.require_activity(activity_id, seq)?;
                self.attempts.insert(activity_id.clone(), *attempt);

                if let RetryDecision::GiveUp { retry_state } = decision {
                    if take(&mut self.open_activities, activity_id) {
                        let wrapped = wrap_across_boundary(
                            failure.clone(),
                            Boundary::Activity {
                                activity_id: activity_id.clone(),
                                activity_type: self.activity_type(activity_id),
                                attempt: *attempt,
                                retry_state: *retry_state,
                            },
                        );
                        let step =
                            self.workflow
                                .on_activity_resolved(&mut self.ctx, activity_id, Err(wrapped));
                        self.absorb(step, seq);
                    }
                }
            }

            EventKind::ChildWorkflowStarted {
                child_key,
                workflow_id,
                run_id,
                workflow_type,
                ..
            } => {
                let index = self.find_pending(seq, |action| {
                    matches!(action, WorkflowAction::StartChildWorkflow { child_key: key, .. } if key == child_key)
                })?;
                if let WorkflowAction::StartChildWorkflow {
                    workflow_type: issued,
                    ..
                } = &self.pending[index].action
                {
                    if issued != workflow_type {
                        return Err(ExecutorError::NonDeterminism(format!(
                            "child {} was started as {} but the workflow now starts {}",
                            child_key, workflow_type, issued
                        )));
                    }
                }
                self.pending.remove(index);
                self.children.insert(
                    child_key.clone(),
                    ChildRef {
                        workflow_id: workflow_id.clone(),
                        run_id: *run_id,
                        workflow_type: workflow_type.clone(),
                    },
                );
                self.recorded_children.push(child_key.clone());
            }

            EventKind::ChildWorkflowCompleted { child_key, result } => {
                if self.closed {
                    return Ok(());
                }
                self.require_child(child_key, seq)?;
                if take(&mut self.open_children, child_key) {
                    let step =
                        self.workflow
                            .on_child_resolved(&mut self.ctx, child_key, Ok(result.clone()));
                    self.absorb(step, seq);
                }
            }

            EventKind::ChildWorkflowFailed { child_key, failure } => {
                if self.closed {
                    return Ok(());
                }
                self.require_child(child_key, seq)?;
                if take(&mut self.open_children, child_key) {
                    let wrapped = self.wrap_child(child_key, failure.clone());
                    let step = self
                        .workflow
                        .on_child_resolved(&mut self.ctx, child_key, Err(wrapped));
                    self.absorb(step, seq);
                }
            }

            EventKind::WorkflowCancelRequested { reason } => {
                if self.closed {
                    return Ok(());
                }
                self.cancel_outstanding(seq, replaying);
                if !self.closed {
                    let step = self.workflow.on_cancel_requested(&mut self.ctx, reason);
                    self.absorb(step, seq);
                }
            }

            EventKind::WorkflowCompleted { .. } => {
                let index = self.find_pending(seq, |action| {
                    matches!(action, WorkflowAction::CompleteWorkflow { .. })
                })?;
                self.pending.remove(index);
            }

            EventKind::WorkflowFailed { .. } => {
                let index = self.find_pending(seq, |action| {
                    matches!(action, WorkflowAction::FailWorkflow { .. })
                })?;
                self.pending.remove(index);
            }

            EventKind::WorkflowTerminated { .. } => {
                self.terminated = true;
            }
        }

        Ok(())
    }

    /// Resolve every outstanding wait with a cancellation
    fn cancel_outstanding(&mut self, seq: u64, replaying: bool) {
        for activity_id in std::mem::take(&mut self.open_activities) {
            if self.closed {
                break;
            }
            // A schedule that never reached the history is simply dropped
            self.pending.retain(|p| {
                !matches!(&p.action, WorkflowAction::ScheduleActivity { activity_id: id, .. } if *id == activity_id)
            });
            let attempt = self.attempts.get(&activity_id).copied().unwrap_or(0) + 1;
            let wrapped = wrap_across_boundary(
                Failure::cancelled("activity cancelled"),
                Boundary::Activity {
                    activity_id: activity_id.clone(),
                    activity_type: self.activity_type(&activity_id),
                    attempt,
                    retry_state: RetryState::Cancelled,
                },
            );
            let step = self
                .workflow
                .on_activity_resolved(&mut self.ctx, &activity_id, Err(wrapped));
            self.absorb(step, seq);
        }

        for child_key in std::mem::take(&mut self.open_children) {
            if self.closed {
                break;
            }
            if self.recorded_children.contains(&child_key) {
                if !replaying {
                    if let Some(child) = self.children.get(&child_key) {
                        self.children_to_cancel.push(child.execution());
                    }
                }
            } else {
                self.pending.retain(|p| {
                    !matches!(&p.action, WorkflowAction::StartChildWorkflow { child_key: key, .. } if *key == child_key)
                });
            }
            let wrapped = self.wrap_child(&child_key, Failure::cancelled("child workflow cancelled"));
            let step = self
                .workflow
                .on_child_resolved(&mut self.ctx, &child_key, Err(wrapped));
            self.absorb(step, seq);
        }
    }

    /// Record the commands a handler returned
    fn absorb(&mut self, step: WorkflowStep, seq: u64) {
        let actions = match step {
            Ok(actions) => actions,
            Err(failure) => vec![WorkflowAction::fail(failure)],
        };

        for action in actions {
            if self.closed {
                break;
            }
            match &action {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    ..
                } => {
                    if self.activities.contains_key(activity_id) {
                        self.issue_invalid(format!("activity id {} is already in use", activity_id), seq);
                        continue;
                    }
                    self.activities
                        .insert(activity_id.clone(), activity_type.clone());
                    self.open_activities.push(activity_id.clone());
                }
                WorkflowAction::StartChildWorkflow {
                    child_key,
                    workflow_type,
                    options,
                    ..
                } => {
                    if self.children.contains_key(child_key) {
                        self.issue_invalid(format!("child key {} is already in use", child_key), seq);
                        continue;
                    }
                    let id = child_execution_id(&self.execution, child_key, options);
                    self.children.insert(
                        child_key.clone(),
                        ChildRef {
                            workflow_id: id.workflow_id,
                            run_id: id.run_id,
                            workflow_type: workflow_type.clone(),
                        },
                    );
                    self.open_children.push(child_key.clone());
                }
                WorkflowAction::CompleteWorkflow { .. } | WorkflowAction::FailWorkflow { .. } => {
                    self.closed = true;
                }
            }
            self.pending.push(Pending {
                action,
                issued_at: seq,
            });
        }
    }

    fn issue_invalid(&mut self, message: String, seq: u64) {
        self.closed = true;
        self.pending.push(Pending {
            action: WorkflowAction::fail(
                Failure::non_retryable(message).with_error_type("InvalidAction"),
            ),
            issued_at: seq,
        });
    }

    fn find_pending(
        &self,
        seq: u64,
        matches: impl Fn(&WorkflowAction) -> bool,
    ) -> Result<usize, ExecutorError> {
        self.pending
            .iter()
            .position(|p| matches(&p.action))
            .ok_or_else(|| {
                ExecutorError::NonDeterminism(format!(
                    "event {} records a command the workflow did not issue",
                    seq
                ))
            })
    }

    fn require_activity(&self, activity_id: &str, seq: u64) -> Result<(), ExecutorError> {
        if self.activities.contains_key(activity_id) {
            Ok(())
        } else {
            Err(ExecutorError::NonDeterminism(format!(
                "event {} resolves activity {} which the workflow never scheduled",
                seq, activity_id
            )))
        }
    }

    fn require_child(&self, child_key: &str, seq: u64) -> Result<(), ExecutorError> {
        if self.children.contains_key(child_key) {
            Ok(())
        } else {
            Err(ExecutorError::NonDeterminism(format!(
                "event {} resolves child {} which the workflow never started",
                seq, child_key
            )))
        }
    }

    fn activity_type(&self, activity_id: &str) -> String {
        self.activities.get(activity_id).cloned().unwrap_or_default()
    }

    fn wrap_child(&self, child_key: &str, failure: Failure) -> Failure {
        let child = self.children.get(child_key);
        wrap_across_boundary(
            failure,
            Boundary::ChildWorkflow {
                workflow_id: child.map(|c| c.workflow_id.clone()).unwrap_or_default(),
                run_id: child.map(|c| c.run_id).unwrap_or_default(),
                workflow_type: child.map(|c| c.workflow_type.clone()).unwrap_or_default(),
            },
        )
    }

    fn finish(
        self,
        replay_cursor: Option<u64>,
        last_sequence: Option<u64>,
    ) -> Result<ReplayOutcome, ExecutorError> {
        if self.terminated {
            return Ok(ReplayOutcome {
                commands: Vec::new(),
                children_to_cancel: Vec::new(),
                last_sequence,
            });
        }

        if let Some(cursor) = replay_cursor {
            if let Some(stale) = self.pending.iter().find(|p| p.issued_at <= cursor) {
                return Err(ExecutorError::NonDeterminism(format!(
                    "workflow issued {} while applying event {}, but the history has no record of it",
                    describe(&stale.action),
                    stale.issued_at
                )));
            }
        }

        Ok(ReplayOutcome {
            commands: self.pending.into_iter().map(|p| p.action).collect(),
            children_to_cancel: self.children_to_cancel,
            last_sequence,
        })
    }
}

fn take(open: &mut Vec<String>, id: &str) -> bool {
    match open.iter().position(|o| o == id) {
        Some(index) => {
            open.remove(index);
            true
        }
        None => false,
    }
}

fn describe(action: &WorkflowAction) -> String {
    match action {
        WorkflowAction::ScheduleActivity {
            activity_id,
            activity_type,
            ..
        } => format!("ScheduleActivity({}, {})", activity_id, activity_type),
        WorkflowAction::StartChildWorkflow {
            child_key,
            workflow_type,
            ..
        } => format!("StartChildWorkflow({}, {})", child_key, workflow_type),
        WorkflowAction::CompleteWorkflow { .. } => "CompleteWorkflow".to_string(),
        WorkflowAction::FailWorkflow { .. } => "FailWorkflow".to_string(),
    }
}
