//! Task polling with exponential backoff
//!
//! Polls one task queue, backing off while it is empty. A wait ends early
//! when something is enqueued or shutdown is signaled.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

use super::queue::WorkflowTask;
use crate::activity::ActivityTask;
use crate::engine::Engine;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when tasks are available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no tasks found
    pub backoff_multiplier: f64,

    /// Maximum tasks to take per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Task poller with adaptive backoff
///
/// Polls for tasks with exponential backoff when idle and resets to the
/// minimum interval when tasks are found.
pub struct TaskPoller {
    engine: Arc<Engine>,
    task_queue: String,
    config: PollerConfig,
    current_interval: Duration,
    enqueued_rx: watch::Receiver<u64>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    /// Create a new task poller
    pub fn new(
        engine: Arc<Engine>,
        task_queue: impl Into<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let enqueued_rx = engine.queues().subscribe();
        Self {
            engine,
            task_queue: task_queue.into(),
            current_interval: config.min_interval,
            config,
            enqueued_rx,
            shutdown_rx,
        }
    }

    /// Take up to `max_tasks` workflow tasks whose type `accepts` approves
    pub fn poll_workflows(
        &mut self,
        max_tasks: usize,
        accepts: impl Fn(&str) -> bool,
    ) -> Vec<WorkflowTask> {
        self.mark_seen();
        let queues = self.engine.queues();
        let tasks: Vec<_> = std::iter::from_fn(|| queues.poll_workflow(&self.task_queue, &accepts))
            .take(max_tasks.min(self.config.batch_size))
            .collect();
        self.record(tasks.len());
        tasks
    }

    /// Take up to `max_tasks` ready activity tasks whose type `accepts` approves
    pub fn poll_activities(
        &mut self,
        max_tasks: usize,
        accepts: impl Fn(&str) -> bool,
    ) -> Vec<ActivityTask> {
        self.mark_seen();
        let queues = self.engine.queues();
        let tasks: Vec<_> = std::iter::from_fn(|| queues.poll_activity(&self.task_queue, &accepts))
            .take(max_tasks.min(self.config.batch_size))
            .collect();
        self.record(tasks.len());
        tasks
    }

    /// Wait for the current backoff interval
    ///
    /// Returns early when a task is enqueued. Returns `true` if shutdown is
    /// signaled.
    pub async fn wait(&mut self) -> bool {
        if self.is_shutdown() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = self.enqueued_rx.changed() => false,
            _ = self.shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    fn mark_seen(&mut self) {
        self.enqueued_rx.borrow_and_update();
    }

    fn record(&mut self, found: usize) {
        if found == 0 {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "no tasks found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = found, task_queue = %self.task_queue, "took tasks");
        }
    }

    /// Reset backoff to minimum interval
    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    /// Increase backoff interval
    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
