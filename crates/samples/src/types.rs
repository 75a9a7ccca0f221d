// Sample payload types
//
// Activities take a single struct so fields can be added later without
// breaking recorded histories.

use serde::{Deserialize, Serialize};

/// Task queue every sample worker polls
pub const TASK_QUEUE: &str = "hello-activity-task-queue";

/// Task queue served by the separate "remote" worker
pub const REMOTE_TASK_QUEUE: &str = "greetings";

/// Workflow id used by the sample runs
pub const WORKFLOW_ID: &str = "hello-activity-workflow-id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeGreetingInput {
    pub greeting: String,
    pub name: String,
}

impl ComposeGreetingInput {
    pub fn hello(name: impl Into<String>) -> Self {
        Self {
            greeting: "Hello".to_string(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeGreetingOutput {
    pub greeting: String,
    pub name: String,
}

/// An error returned as a value; the engine treats it as a successful result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeGreetingError {
    pub error: String,
}

/// Either a greeting or an error value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GreetingReply {
    Greeting(ComposeGreetingOutput),
    Error(ComposeGreetingError),
}
