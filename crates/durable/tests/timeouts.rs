//! Activity timeouts recorded by a running worker

mod common;

use std::time::Duration;

use common::*;
use keel_durable::prelude::*;
use keel_durable::workflow::EventKind;
use test_log::test;

#[test(tokio::test)]
async fn test_start_to_close_timeout_is_retried() {
    let engine = memory_engine();
    let calls = Calls::default();
    let mut worker = worker(&engine);
    worker.register_activity(Sleep(calls.clone()));
    worker.start().unwrap();

    let options = retries(2).with_start_to_close_timeout(Duration::from_millis(50));
    let client = Client::new(engine.clone());
    let handle = client
        .start_workflow::<CallActivity>(
            ActivityCall::new("sleep", json!(1_000)).with_options(options),
            StartWorkflowOptions::new(),
        )
        .await
        .unwrap();

    let Err(ClientError::WorkflowFailed(error)) = handle.result().await else {
        panic!("expected the workflow to fail");
    };
    assert_eq!(calls.get(), 2);
    assert!(matches!(
        error.cause.kind(),
        FailureKind::Activity {
            attempt: 2,
            retry_state: RetryState::MaximumAttemptsReached,
            ..
        }
    ));
    assert!(matches!(
        error.root_cause().kind(),
        FailureKind::Timeout {
            timeout_type: TimeoutType::StartToClose
        }
    ));

    let history = handle.history().await.unwrap();
    let timeouts = history
        .iter()
        .filter(|e| {
            matches!(
                &e.kind,
                EventKind::ActivityFailed { failure, .. } if failure.is_timeout()
            )
        })
        .count();
    assert_eq!(timeouts, 2);
    worker.shutdown().await.unwrap();
}

#[test(tokio::test)]
async fn test_schedule_to_start_timeout_fails_unpolled_task() {
    let engine = memory_engine();
    let worker = worker(&engine);
    worker.start().unwrap();

    // No worker polls this queue
    let options = ActivityOptions::default()
        .with_task_queue("nowhere")
        .with_schedule_to_start_timeout(Duration::from_millis(50))
        .with_retry(RetryPolicy::no_retry());
    let client = Client::new(engine.clone());
    let result = client
        .execute_workflow::<CallActivity>(
            ActivityCall::new("greet", json!("World")).with_options(options),
            StartWorkflowOptions::new(),
        )
        .await;

    let Err(ClientError::WorkflowFailed(error)) = result else {
        panic!("expected the workflow to fail");
    };
    assert!(matches!(
        error.root_cause().kind(),
        FailureKind::Timeout {
            timeout_type: TimeoutType::ScheduleToStart
        }
    ));
    assert_eq!(engine.queues().activity_backlog("nowhere"), 0);
    worker.shutdown().await.unwrap();
}
