//! Activity task handed to workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persistence::ExecutionId;
use crate::workflow::ActivityOptions;

/// One attempt of a scheduled activity, waiting for a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    /// Workflow run that scheduled the activity
    pub execution: ExecutionId,

    /// Activity ID within the workflow
    pub activity_id: String,

    /// Registered activity type
    pub activity_type: String,

    /// Input for the activity
    pub input: serde_json::Value,

    /// Attempt number (1-based)
    pub attempt: u32,

    /// Queue the task is routed to
    pub task_queue: String,

    /// Options recorded when the activity was scheduled
    pub options: ActivityOptions,

    /// When this attempt was enqueued
    pub scheduled_at: DateTime<Utc>,
}

impl ActivityTask {
    /// The task for the attempt after this one
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            scheduled_at: Utc::now(),
            ..self.clone()
        }
    }
}
