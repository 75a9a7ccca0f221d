// Keel samples
//
// Workflows showing the difference between exceptions and errors: raised
// activity exceptions are retried and wrapped on the way out, while errors
// returned as values are ordinary results.

pub mod activities;
pub mod types;
pub mod workflows;

use keel_durable::Worker;

pub use activities::{
    ComposeGreeting, GetGreeting, ReturnError, ThrowException, ThrowNonRetryableException,
};
pub use types::{
    ComposeGreetingError, ComposeGreetingInput, ComposeGreetingOutput, GreetingReply,
    REMOTE_TASK_QUEUE, TASK_QUEUE, WORKFLOW_ID,
};
pub use workflows::{
    ExceptionInChildWorkflow, ExceptionWorkflow, GreetingWorkflow, NonRetryableExceptionWorkflow,
    RemoteActivityWorkflow, ReturnErrorInChildWorkflow, ReturnErrorWorkflow,
};

/// Register every sample workflow and local activity
pub fn register_samples(worker: &mut Worker) {
    worker
        .register_workflow::<GreetingWorkflow>()
        .register_workflow::<ExceptionWorkflow>()
        .register_workflow::<NonRetryableExceptionWorkflow>()
        .register_workflow::<ExceptionInChildWorkflow>()
        .register_workflow::<RemoteActivityWorkflow>()
        .register_workflow::<ReturnErrorWorkflow>()
        .register_workflow::<ReturnErrorInChildWorkflow>()
        .register_activity(ComposeGreeting)
        .register_activity(ThrowException)
        .register_activity(ThrowNonRetryableException)
        .register_activity(ReturnError);
}

/// Register the activity served on [`REMOTE_TASK_QUEUE`]
pub fn register_remote(worker: &mut Worker) {
    worker.register_activity(GetGreeting);
}
