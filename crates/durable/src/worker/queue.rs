//! In-memory task queues
//!
//! Queues are named routing keys. Each holds workflow tasks (run the next
//! tick of an execution) and activity tasks (run one attempt). Nothing here
//! is durable: the history is the source of truth and
//! [`Engine::recover`](crate::engine::Engine::recover) rebuilds the queues
//! from it after a restart.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::activity::ActivityTask;
use crate::persistence::ExecutionId;

/// Request to run the next tick of an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub execution: ExecutionId,
    pub workflow_type: String,
}

struct QueuedActivity {
    task: ActivityTask,
    ready_at: Instant,
    /// Schedule-to-start deadline
    deadline: Option<Instant>,
}

#[derive(Default)]
struct QueueState {
    workflows: VecDeque<WorkflowTask>,
    activities: VecDeque<QueuedActivity>,
}

/// Named task queues shared by the engine and its workers
pub struct TaskQueues {
    queues: Mutex<HashMap<String, QueueState>>,
    /// Bumped on every enqueue
    version: watch::Sender<u64>,
}

impl Default for TaskQueues {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            version: watch::Sender::new(0),
        }
    }
}

impl TaskQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a tick for an execution
    ///
    /// An execution has at most one pending workflow task; a second request
    /// while one is queued is absorbed by it.
    pub fn enqueue_workflow(&self, task_queue: &str, task: WorkflowTask) {
        {
            let mut queues = self.queues.lock();
            let queue = queues.entry(task_queue.to_string()).or_default();
            if queue.workflows.iter().any(|t| t.execution == task.execution) {
                return;
            }
            queue.workflows.push_back(task);
        }
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Queue an activity attempt that becomes available after `delay`
    pub fn enqueue_activity(&self, task: ActivityTask, delay: Duration) {
        let ready_at = Instant::now() + delay;
        let deadline = task
            .options
            .schedule_to_start_timeout
            .map(|timeout| ready_at + timeout);
        {
            let mut queues = self.queues.lock();
            let queue = queues.entry(task.task_queue.clone()).or_default();
            queue.activities.push_back(QueuedActivity {
                task,
                ready_at,
                deadline,
            });
        }
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Take the oldest workflow task whose type `accepts` approves
    pub fn poll_workflow(
        &self,
        task_queue: &str,
        accepts: impl Fn(&str) -> bool,
    ) -> Option<WorkflowTask> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(task_queue)?;
        let index = queue
            .workflows
            .iter()
            .position(|t| accepts(&t.workflow_type))?;
        queue.workflows.remove(index)
    }

    /// Take the oldest ready activity task whose type `accepts` approves
    ///
    /// Tasks past their schedule-to-start deadline are left for
    /// [`TaskQueues::take_expired`].
    pub fn poll_activity(
        &self,
        task_queue: &str,
        accepts: impl Fn(&str) -> bool,
    ) -> Option<ActivityTask> {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(task_queue)?;
        let index = queue.activities.iter().position(|q| {
            q.ready_at <= now
                && q.deadline.map_or(true, |d| d > now)
                && accepts(&q.task.activity_type)
        })?;
        queue.activities.remove(index).map(|q| q.task)
    }

    /// Remove and return every activity task whose deadline has passed
    pub fn take_expired(&self) -> Vec<ActivityTask> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut queues = self.queues.lock();
        for queue in queues.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = queue
                .activities
                .drain(..)
                .partition(|q| q.deadline.is_some_and(|d| d <= now));
            queue.activities = kept.into();
            expired.extend(gone.into_iter().map(|q| q.task));
        }
        expired
    }

    /// Drop queued activity tasks of an execution
    pub fn remove_activities(&self, execution: &ExecutionId) -> usize {
        let mut removed = 0;
        let mut queues = self.queues.lock();
        for queue in queues.values_mut() {
            let before = queue.activities.len();
            queue.activities.retain(|q| &q.task.execution != execution);
            removed += before - queue.activities.len();
        }
        removed
    }

    /// Receiver that changes whenever a task is enqueued
    ///
    /// Mark the current value seen before polling; an enqueue that lands
    /// after that is never missed by `changed()`.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Pending workflow tasks on a queue
    pub fn workflow_backlog(&self, task_queue: &str) -> usize {
        self.queues
            .lock()
            .get(task_queue)
            .map_or(0, |q| q.workflows.len())
    }

    /// Pending activity tasks on a queue, ready or not
    pub fn activity_backlog(&self, task_queue: &str) -> usize {
        self.queues
            .lock()
            .get(task_queue)
            .map_or(0, |q| q.activities.len())
    }
}

impl std::fmt::Debug for TaskQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues = self.queues.lock();
        let mut debug = f.debug_map();
        for (name, queue) in queues.iter() {
            debug.entry(name, &(queue.workflows.len(), queue.activities.len()));
        }
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ActivityOptions;
    use uuid::Uuid;

    fn execution(n: u128) -> ExecutionId {
        ExecutionId::new("wf", Uuid::from_u128(n))
    }

    fn activity(activity_type: &str, options: ActivityOptions) -> ActivityTask {
        ActivityTask {
            execution: execution(1),
            activity_id: "1".into(),
            activity_type: activity_type.into(),
            input: serde_json::Value::Null,
            attempt: 1,
            task_queue: "default".into(),
            options,
            scheduled_at: chrono::Utc::now(),
        }
    }

    fn workflow_task(n: u128, workflow_type: &str) -> WorkflowTask {
        WorkflowTask {
            execution: execution(n),
            workflow_type: workflow_type.into(),
        }
    }

    #[test]
    fn test_workflow_tasks_are_deduplicated() {
        let queues = TaskQueues::new();
        queues.enqueue_workflow("default", workflow_task(1, "greeting"));
        queues.enqueue_workflow("default", workflow_task(1, "greeting"));
        queues.enqueue_workflow("default", workflow_task(2, "greeting"));

        assert_eq!(queues.workflow_backlog("default"), 2);
        assert_eq!(
            queues.poll_workflow("default", |_| true),
            Some(workflow_task(1, "greeting"))
        );
    }

    #[test]
    fn test_poll_filters_by_type_and_queue() {
        let queues = TaskQueues::new();
        queues.enqueue_workflow("default", workflow_task(1, "parent"));
        queues.enqueue_workflow("default", workflow_task(2, "child"));

        assert!(queues.poll_workflow("other", |_| true).is_none());
        let task = queues.poll_workflow("default", |t| t == "child").unwrap();
        assert_eq!(task.execution, execution(2));
        assert_eq!(queues.workflow_backlog("default"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_activity_becomes_ready() {
        let queues = TaskQueues::new();
        queues.enqueue_activity(
            activity("greet", ActivityOptions::default()),
            Duration::from_secs(2),
        );

        assert!(queues.poll_activity("default", |_| true).is_none());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(queues.poll_activity("default", |_| true).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_tasks_are_taken_out() {
        let queues = TaskQueues::new();
        let options =
            ActivityOptions::default().with_schedule_to_start_timeout(Duration::from_secs(1));
        queues.enqueue_activity(activity("greet", options), Duration::ZERO);
        queues.enqueue_activity(
            activity("other", ActivityOptions::default()),
            Duration::ZERO,
        );

        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(queues.poll_activity("default", |t| t == "greet").is_none());
        let expired = queues.take_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].activity_type, "greet");
        assert_eq!(queues.activity_backlog("default"), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_enqueues() {
        let queues = TaskQueues::new();
        let mut rx = queues.subscribe();
        rx.borrow_and_update();

        queues.enqueue_workflow("default", workflow_task(1, "greeting"));
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_remove_activities_of_execution() {
        let queues = TaskQueues::new();
        queues.enqueue_activity(activity("a", ActivityOptions::default()), Duration::ZERO);
        queues.enqueue_activity(activity("b", ActivityOptions::default()), Duration::ZERO);

        assert_eq!(queues.remove_activities(&execution(1)), 2);
        assert_eq!(queues.remove_activities(&execution(1)), 0);
    }
}
