//! Shared engine state
//!
//! The [`Engine`] owns the event store, the task queues and the
//! per-execution tick locks. Every mutation of an execution happens while
//! its lock is held; work that touches another execution (notifying a
//! parent, starting or terminating a child) runs only after the lock is
//! released, so two locks are never held at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::coordinator::{ChildStart, ChildWorkflowCoordinator};
use crate::activity::ActivityTask;
use crate::failure::{Failure, RetryState, TimeoutType};
use crate::persistence::{
    ExecutionId, ExecutionUpdate, ParentLink, StoreError, WorkflowEventStore, WorkflowExecution,
    WorkflowStatus,
};
use crate::reliability::{should_retry, RetryDecision};
use crate::worker::{TaskQueues, WorkflowTask};
use crate::workflow::{ActivityOptions, Event, EventKind, NewEvent};

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The workflow id already has a run that is not closed
    #[error("workflow {0} already has a running execution")]
    AlreadyStarted(String),

    /// No run exists for the workflow id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The operation needs a running execution
    #[error("execution {0} is {1}")]
    NotRunning(ExecutionId, WorkflowStatus),
}

/// A run about to be created
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: ExecutionId,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Value,
    pub parent: Option<ParentLink>,
}

/// What [`Engine::recover`] put back in motion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Running executions that got a workflow task
    pub executions: usize,
    /// Runs whose `WorkflowStarted` event was missing
    pub started: usize,
    /// Activity attempts put back on their queues
    pub activities_requeued: usize,
    /// Started children that were re-ensured
    pub children_ensured: usize,
    /// Closed children whose parent was notified again
    pub parents_notified: usize,
}

/// The durable execution engine
///
/// Clients and workers share one engine through an `Arc`. The store is the
/// only state that survives a restart; call [`Engine::recover`] after
/// opening a durable store to rebuild the in-memory queues.
pub struct Engine {
    store: Arc<dyn WorkflowEventStore>,
    queues: TaskQueues,
    tick_locks: DashMap<ExecutionId, Arc<Mutex<()>>>,
    /// Serializes run creation so a workflow id has at most one open run
    start_lock: Mutex<()>,
    /// Cancellation tokens of running activity attempts
    inflight: DashMap<(ExecutionId, String), CancellationToken>,
    /// Bumped every time an execution closes
    closed_tx: watch::Sender<u64>,
}

impl Engine {
    /// Create an engine on top of a store
    pub fn new(store: Arc<dyn WorkflowEventStore>) -> Self {
        let (closed_tx, _) = watch::channel(0);
        Self {
            store,
            queues: TaskQueues::new(),
            tick_locks: DashMap::new(),
            start_lock: Mutex::new(()),
            inflight: DashMap::new(),
            closed_tx,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowEventStore> {
        &self.store
    }

    pub fn queues(&self) -> &TaskQueues {
        &self.queues
    }

    /// Parent/child linkage
    pub fn children(&self) -> ChildWorkflowCoordinator<'_> {
        ChildWorkflowCoordinator::new(self)
    }

    /// Take the tick lock of an execution
    pub(crate) async fn lock(&self, id: &ExecutionId) -> OwnedMutexGuard<()> {
        let lock = self.tick_locks.entry(id.clone()).or_default().clone();
        lock.lock_owned().await
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Start a new top-level run of a workflow
    ///
    /// Fails with [`EngineError::AlreadyStarted`] while another run of the
    /// same workflow id is open. Closed ids can be reused.
    #[instrument(skip(self, input))]
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        task_queue: &str,
        input: Value,
    ) -> Result<ExecutionId, EngineError> {
        let id = ExecutionId::new_run(workflow_id);
        self.create_run(NewRun {
            id: id.clone(),
            workflow_type: workflow_type.to_string(),
            task_queue: task_queue.to_string(),
            input,
            parent: None,
        })
        .await?;

        info!(run_id = %id.run_id, "workflow started");
        Ok(id)
    }

    /// Create a run unless its run id already exists
    ///
    /// Returns `false` when the run existed already.
    pub(crate) async fn create_run(&self, run: NewRun) -> Result<bool, EngineError> {
        let _start = self.start_lock.lock().await;

        match self.store.get_execution(&run.id).await {
            Ok(_) => return Ok(false),
            Err(StoreError::ExecutionNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(latest) = self.store.latest_run(&run.id.workflow_id).await? {
            if !latest.status.is_terminal() {
                return Err(EngineError::AlreadyStarted(run.id.workflow_id));
            }
        }

        let mut execution =
            WorkflowExecution::new(run.id, run.workflow_type, run.task_queue, run.input);
        if let Some(parent) = run.parent {
            execution = execution.with_parent(parent);
        }
        self.store.create_execution(execution.clone()).await?;
        self.begin(&execution).await?;
        Ok(true)
    }

    /// Write `WorkflowStarted`, mark the run running and queue its first tick
    async fn begin(&self, execution: &WorkflowExecution) -> Result<(), EngineError> {
        let id = &execution.id;
        {
            let _tick = self.lock(id).await;
            let started = NewEvent::new(EventKind::WorkflowStarted {
                workflow_type: execution.workflow_type.clone(),
                task_queue: execution.task_queue.clone(),
                input: execution.input.clone(),
                parent: execution.parent.clone(),
            });
            match self.store.append_event(id, 0, started).await {
                Ok(_) => {}
                Err(StoreError::Conflict(conflict)) => {
                    debug!(execution = %id, %conflict, "start event already recorded");
                }
                Err(e) => return Err(e.into()),
            }
            self.store
                .update_execution(id, ExecutionUpdate::status(WorkflowStatus::Running))
                .await?;
        }

        self.queue_tick(execution);
        Ok(())
    }

    pub(crate) fn queue_tick(&self, execution: &WorkflowExecution) {
        self.queues.enqueue_workflow(
            &execution.task_queue,
            WorkflowTask {
                execution: execution.id.clone(),
                workflow_type: execution.workflow_type.clone(),
            },
        );
    }

    /// Most recent run of a workflow id
    pub async fn latest_run(&self, workflow_id: &str) -> Result<WorkflowExecution, EngineError> {
        self.store
            .latest_run(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Wait until an execution reaches a terminal status
    pub async fn wait_closed(&self, id: &ExecutionId) -> Result<WorkflowExecution, EngineError> {
        let mut closed = self.closed_tx.subscribe();
        loop {
            let execution = self.store.get_execution(id).await?;
            if execution.status.is_terminal() {
                return Ok(execution);
            }
            // The sender lives as long as the engine, so this only waits
            let _ = closed.changed().await;
        }
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Token for an attempt about to run, tripped on cancel or terminate
    pub(crate) fn register_attempt(&self, task: &ActivityTask) -> CancellationToken {
        let token = CancellationToken::new();
        self.inflight.insert(
            (task.execution.clone(), task.activity_id.clone()),
            token.clone(),
        );
        token
    }

    /// Trip every in-flight token of an execution and drop its queued attempts
    pub(crate) fn abandon_activities(&self, id: &ExecutionId) {
        self.inflight.retain(|(execution, _), token| {
            if execution == id {
                token.cancel();
                false
            } else {
                true
            }
        });
        let removed = self.queues.remove_activities(id);
        if removed > 0 {
            debug!(execution = %id, removed, "dropped queued activity tasks");
        }
    }

    /// Record the outcome of one activity attempt
    ///
    /// Appends exactly one `ActivityCompleted` or `ActivityFailed` event. A
    /// failure is judged against the retry policy recorded when the activity
    /// was scheduled, and the decision is stored with it. Results for closed
    /// executions, resolved activities or attempts already recorded are
    /// dropped.
    #[instrument(
        skip(self, task, outcome),
        fields(
            execution = %task.execution,
            activity_id = %task.activity_id,
            attempt = task.attempt
        )
    )]
    pub async fn record_activity_result(
        &self,
        task: &ActivityTask,
        outcome: Result<Value, Failure>,
    ) -> Result<(), EngineError> {
        self.inflight
            .remove(&(task.execution.clone(), task.activity_id.clone()));

        let (execution, retry_after) = {
            let _tick = self.lock(&task.execution).await;

            let execution = self.store.get_execution(&task.execution).await?;
            if execution.status.is_terminal() {
                debug!(status = %execution.status, "execution closed, dropping activity result");
                return Ok(());
            }

            let history = self.store.load_events(&task.execution).await?;
            let Some(activity) = scheduled_activities(&history)
                .into_iter()
                .find(|a| a.activity_id == task.activity_id)
            else {
                warn!("result for an activity that was never scheduled");
                return Ok(());
            };
            if activity.resolved || activity.failed_attempts >= task.attempt {
                debug!("attempt already recorded");
                return Ok(());
            }

            let (kind, retry_after) = match outcome {
                Ok(result) => {
                    debug!("activity completed");
                    let kind = EventKind::ActivityCompleted {
                        activity_id: task.activity_id.clone(),
                        attempt: task.attempt,
                        result,
                    };
                    (kind, None)
                }
                Err(failure) => {
                    let decision = if cancel_requested(&history) {
                        RetryDecision::GiveUp {
                            retry_state: RetryState::Cancelled,
                        }
                    } else {
                        should_retry(&failure, task.attempt, &activity.options.retry_policy)
                    };
                    let retry_after = match &decision {
                        RetryDecision::Retry { after } => {
                            info!(
                                failure = %failure,
                                retry_in_ms = after.as_millis() as u64,
                                "activity attempt failed, retrying"
                            );
                            Some(*after)
                        }
                        RetryDecision::GiveUp { retry_state } => {
                            warn!(failure = %failure, %retry_state, "activity failed");
                            None
                        }
                    };
                    let kind = EventKind::ActivityFailed {
                        activity_id: task.activity_id.clone(),
                        attempt: task.attempt,
                        failure,
                        decision,
                    };
                    (kind, retry_after)
                }
            };

            match self
                .store
                .append_event(&task.execution, history.len() as u64, NewEvent::new(kind))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_duplicate_event() => {
                    debug!("duplicate activity result rejected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            (execution, retry_after)
        };

        match retry_after {
            Some(delay) => self.queues.enqueue_activity(task.next_attempt(), delay),
            None => self.queue_tick(&execution),
        }
        Ok(())
    }

    /// Fail queued attempts that waited past their schedule-to-start deadline
    ///
    /// Returns how many attempts timed out.
    pub async fn expire_overdue_tasks(&self) -> Result<usize, EngineError> {
        let expired = self.queues.take_expired();
        let count = expired.len();
        for task in expired {
            warn!(
                execution = %task.execution,
                activity_id = %task.activity_id,
                attempt = task.attempt,
                "activity task was not started in time"
            );
            self.record_activity_result(&task, Err(Failure::timeout(TimeoutType::ScheduleToStart)))
                .await?;
        }
        Ok(count)
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Ask a running execution to cancel
    ///
    /// The request is recorded as `WorkflowCancelRequested`; the next tick
    /// resolves every outstanding wait with a cancellation. In-flight
    /// attempts have their tokens tripped. Repeated requests are no-ops.
    #[instrument(skip(self))]
    pub async fn request_cancel(&self, id: &ExecutionId, reason: &str) -> Result<(), EngineError> {
        let execution = {
            let _tick = self.lock(id).await;
            let execution = self.running(id).await?;
            let next = self.store.next_sequence(id).await?;
            let event = NewEvent::new(EventKind::WorkflowCancelRequested {
                reason: reason.to_string(),
            });
            match self.store.append_event(id, next, event).await {
                Ok(_) => info!("cancellation requested"),
                Err(e) if e.is_duplicate_event() => {
                    debug!("cancellation already requested");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            execution
        };

        self.abandon_activities(id);
        self.queue_tick(&execution);
        Ok(())
    }

    /// Close a running execution without running workflow code
    ///
    /// The run ends `Terminated` with a cancellation failure, and so do its
    /// open children.
    #[instrument(skip(self))]
    pub async fn terminate(&self, id: &ExecutionId, reason: &str) -> Result<(), EngineError> {
        let execution = {
            let _tick = self.lock(id).await;
            self.running(id).await?;
            let next = self.store.next_sequence(id).await?;
            let kind = EventKind::WorkflowTerminated {
                reason: reason.to_string(),
            };
            let update = close_update(&kind);
            self.store
                .append_event(id, next, NewEvent::new(kind))
                .await?;
            if let Some(update) = update {
                self.store
                    .update_execution(id, update.with_cursor(next))
                    .await?;
            }
            self.store.get_execution(id).await?
        };

        warn!("workflow terminated");
        self.abandon_activities(id);
        self.after_close(&execution).await
    }

    async fn running(&self, id: &ExecutionId) -> Result<WorkflowExecution, EngineError> {
        let execution = self.store.get_execution(id).await?;
        if execution.status != WorkflowStatus::Running {
            return Err(EngineError::NotRunning(id.clone(), execution.status));
        }
        Ok(execution)
    }

    /// Follow-ups of a run that just closed
    ///
    /// Wakes [`Engine::wait_closed`] callers, reports the result to the
    /// parent, and terminates children that are still open.
    pub(crate) fn after_close<'a>(
        &'a self,
        execution: &'a WorkflowExecution,
    ) -> futures::future::BoxFuture<'a, Result<(), EngineError>> {
        async move {
            self.closed_tx.send_modify(|closed| *closed += 1);

            if execution.parent.is_some() {
                self.children().on_child_closed(&execution.id).await?;
            }

            let history = self.store.load_events(&execution.id).await?;
            for child in open_children(&history) {
                let reason = format!("parent {} closed", execution.id);
                match self.terminate(&child.execution, &reason).boxed().await {
                    Ok(()) | Err(EngineError::NotRunning(..)) => {}
                    Err(EngineError::Store(StoreError::ExecutionNotFound(_))) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
        .boxed()
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Rebuild the task queues from the store
    ///
    /// For each running execution: queue the next attempt of every
    /// activity that has no resolution, make sure every started child
    /// exists (delivering children that already closed), and queue a tick.
    /// Closed children notify their parents again; duplicates are rejected
    /// by event id.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();

        for execution in self.store.list_executions(None).await? {
            match execution.status {
                WorkflowStatus::NotStarted => {
                    self.begin(&execution).await?;
                    report.started += 1;
                }
                WorkflowStatus::Running => {
                    self.recover_running(&execution, &mut report).await?;
                }
                _ => {
                    if execution.parent.is_some() {
                        self.children().on_child_closed(&execution.id).await?;
                        report.parents_notified += 1;
                    }
                }
            }
        }

        info!(
            executions = report.executions,
            activities = report.activities_requeued,
            children = report.children_ensured,
            "recovery complete"
        );
        Ok(report)
    }

    async fn recover_running(
        &self,
        execution: &WorkflowExecution,
        report: &mut RecoveryReport,
    ) -> Result<(), EngineError> {
        let history = self.store.load_events(&execution.id).await?;
        if history.is_empty() {
            self.begin(execution).await?;
            report.started += 1;
            return Ok(());
        }

        if !cancel_requested(&history) {
            for activity in scheduled_activities(&history)
                .into_iter()
                .filter(|a| !a.resolved)
            {
                let task_queue = activity
                    .options
                    .task_queue
                    .clone()
                    .unwrap_or_else(|| execution.task_queue.clone());
                debug!(
                    execution = %execution.id,
                    activity_id = %activity.activity_id,
                    attempt = activity.failed_attempts + 1,
                    "requeueing activity"
                );
                let delay = activity
                    .retry_at
                    .and_then(|at| (at - Utc::now()).to_std().ok())
                    .unwrap_or(Duration::ZERO);
                self.queues.enqueue_activity(
                    ActivityTask {
                        execution: execution.id.clone(),
                        activity_id: activity.activity_id,
                        activity_type: activity.activity_type,
                        input: activity.input,
                        attempt: activity.failed_attempts + 1,
                        task_queue,
                        options: activity.options,
                        scheduled_at: Utc::now(),
                    },
                    delay,
                );
                report.activities_requeued += 1;
            }
        }

        for child in open_children(&history) {
            self.children().start_child(&execution.id, child).await?;
            report.children_ensured += 1;
        }

        self.queue_tick(execution);
        report.executions += 1;
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("queues", &self.queues)
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

/// Status and record update for a terminal event
pub(crate) fn close_update(kind: &EventKind) -> Option<ExecutionUpdate> {
    match kind {
        EventKind::WorkflowCompleted { result } => Some(ExecutionUpdate::closed(
            WorkflowStatus::Completed,
            Some(result.clone()),
            None,
        )),
        EventKind::WorkflowFailed { failure } => {
            // A run that gave in to cancellation is terminated, not failed
            let status = if failure.is_cancelled() {
                WorkflowStatus::Terminated
            } else {
                WorkflowStatus::Failed
            };
            Some(ExecutionUpdate::closed(status, None, Some(failure.clone())))
        }
        EventKind::WorkflowTerminated { reason } => Some(ExecutionUpdate::closed(
            WorkflowStatus::Terminated,
            None,
            Some(Failure::cancelled(format!("workflow terminated: {}", reason))),
        )),
        _ => None,
    }
}

/// An activity as recorded in a history
#[derive(Debug, Clone)]
struct ScheduledActivity {
    activity_id: String,
    activity_type: String,
    input: Value,
    options: ActivityOptions,
    failed_attempts: u32,
    /// When the pending retry becomes due
    retry_at: Option<DateTime<Utc>>,
    resolved: bool,
}

fn scheduled_activities(history: &[Event]) -> Vec<ScheduledActivity> {
    let mut activities: Vec<ScheduledActivity> = Vec::new();
    for event in history {
        match &event.kind {
            EventKind::ActivityScheduled {
                activity_id,
                activity_type,
                input,
                options,
            } => activities.push(ScheduledActivity {
                activity_id: activity_id.clone(),
                activity_type: activity_type.clone(),
                input: input.clone(),
                options: options.clone(),
                failed_attempts: 0,
                retry_at: None,
                resolved: false,
            }),
            EventKind::ActivityCompleted { activity_id, .. } => {
                if let Some(a) = activities.iter_mut().find(|a| &a.activity_id == activity_id) {
                    a.resolved = true;
                }
            }
            EventKind::ActivityFailed {
                activity_id,
                attempt,
                decision,
                ..
            } => {
                if let Some(a) = activities.iter_mut().find(|a| &a.activity_id == activity_id) {
                    a.failed_attempts = a.failed_attempts.max(*attempt);
                    a.resolved |= !decision.is_retry();
                    a.retry_at = match decision {
                        RetryDecision::Retry { after } => chrono::Duration::from_std(*after)
                            .ok()
                            .map(|after| event.timestamp + after),
                        RetryDecision::GiveUp { .. } => None,
                    };
                }
            }
            _ => {}
        }
    }
    activities
}

/// Children started in a history that have not closed yet
fn open_children(history: &[Event]) -> Vec<ChildStart> {
    let mut children: Vec<ChildStart> = Vec::new();
    for event in history {
        match &event.kind {
            EventKind::ChildWorkflowStarted {
                child_key,
                workflow_id,
                run_id,
                workflow_type,
                task_queue,
                input,
            } => children.push(ChildStart {
                child_key: child_key.clone(),
                execution: ExecutionId::new(workflow_id.clone(), *run_id),
                workflow_type: workflow_type.clone(),
                task_queue: task_queue.clone(),
                input: input.clone(),
            }),
            EventKind::ChildWorkflowCompleted { child_key, .. }
            | EventKind::ChildWorkflowFailed { child_key, .. } => {
                children.retain(|c| &c.child_key != child_key);
            }
            _ => {}
        }
    }
    children
}

fn cancel_requested(history: &[Event]) -> bool {
    history
        .iter()
        .any(|e| matches!(e.kind, EventKind::WorkflowCancelRequested { .. }))
}
