//! Crash recovery on the file store
//!
//! A "crash" drops the engine with its in-memory queues; only the store
//! directory survives. Recovery must finish the run without repeating work
//! whose result is already in the history.

mod common;

use std::path::Path;
use std::time::Duration;

use common::*;
use keel_durable::prelude::*;
use keel_durable::workflow::EventKind;
use test_log::test;

fn file_engine(dir: &Path) -> Arc<Engine> {
    let store = FileWorkflowEventStore::open(dir).unwrap();
    Arc::new(Engine::new(Arc::new(store)))
}

async fn wait_for_event(engine: &Engine, id: &ExecutionId, pred: impl Fn(&EventKind) -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let history = engine.store().load_events(id).await.unwrap();
            if history.iter().any(|e| pred(&e.kind)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("event did not appear in time");
}

#[test(tokio::test)]
async fn test_recovery_does_not_repeat_completed_activities() {
    let dir = tempfile::tempdir().unwrap();
    let greets = Calls::default();
    let shouts = Calls::default();

    let id = {
        // First process: can greet but not shout
        let engine = file_engine(dir.path());
        let mut worker = worker(&engine);
        worker.register_activity(Greet(greets.clone()));
        worker.start().unwrap();

        let id = engine
            .start_workflow("crash", GreetThenShout::TYPE, QUEUE, json!("World"))
            .await
            .unwrap();
        wait_for_event(&engine, &id, |k| {
            matches!(k, EventKind::ActivityScheduled { activity_id, .. } if activity_id == "shout")
        })
        .await;

        worker.shutdown().await.unwrap();
        id
    };
    assert_eq!(greets.get(), 1);

    // Second process
    let engine = file_engine(dir.path());
    let report = engine.recover().await.unwrap();
    assert_eq!(report.executions, 1);
    assert_eq!(report.activities_requeued, 1);

    let mut worker = worker(&engine);
    worker
        .register_activity(Greet(greets.clone()))
        .register_activity(Shout(shouts.clone()));
    worker.start().unwrap();

    let execution = closed(&engine, &id).await;
    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(execution.result, Some(json!("HELLO, WORLD!")));
    assert_eq!(greets.get(), 1);
    assert_eq!(shouts.get(), 1);

    let history = engine.store().load_events(&id).await.unwrap();
    let completions = history
        .iter()
        .filter(|e| matches!(e.kind, EventKind::ActivityCompleted { .. }))
        .count();
    assert_eq!(completions, 2);
    worker.shutdown().await.unwrap();
}

#[test(tokio::test)]
async fn test_recovery_after_result_recorded_but_not_applied() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let engine = file_engine(dir.path());
        let mut executor = WorkflowExecutor::new(engine.clone());
        executor.register::<GreetThenShout>();

        let id = engine
            .start_workflow("applied", GreetThenShout::TYPE, QUEUE, json!("World"))
            .await
            .unwrap();
        executor.process_workflow(&id).await.unwrap();

        // The attempt's result is durable; the tick that reacts to it never runs
        let task = engine.queues().poll_activity(QUEUE, |_| true).unwrap();
        engine
            .record_activity_result(&task, Ok(json!("Hello, World!")))
            .await
            .unwrap();
        id
    };

    let engine = file_engine(dir.path());
    let report = engine.recover().await.unwrap();
    assert_eq!(report.activities_requeued, 0);

    let greets = Calls::default();
    let mut worker = worker(&engine);
    worker
        .register_activity(Greet(greets.clone()))
        .register_activity(Shout(Calls::default()));
    worker.start().unwrap();

    let execution = closed(&engine, &id).await;
    assert_eq!(execution.result, Some(json!("HELLO, WORLD!")));
    assert_eq!(greets.get(), 0);
    worker.shutdown().await.unwrap();
}

#[test(tokio::test)]
async fn test_recovery_resumes_retry_count() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Calls::default();

    let id = {
        let engine = file_engine(dir.path());
        let mut executor = WorkflowExecutor::new(engine.clone());
        executor.register::<CallActivity>();

        let call = ActivityCall::new("always_fails", json!(null)).with_options(retries(3));
        let id = engine
            .start_workflow("retry", CallActivity::TYPE, QUEUE, serde_json::to_value(call).unwrap())
            .await
            .unwrap();
        executor.process_workflow(&id).await.unwrap();

        // First attempt fails before the crash
        let task = engine.queues().poll_activity(QUEUE, |_| true).unwrap();
        engine
            .record_activity_result(&task, Err(Failure::application("Exception from activity")))
            .await
            .unwrap();
        id
    };

    let engine = file_engine(dir.path());
    engine.recover().await.unwrap();

    let mut worker = worker(&engine);
    worker.register_activity(AlwaysFails(calls.clone()));
    worker.start().unwrap();

    let execution = closed(&engine, &id).await;
    assert_eq!(execution.status, WorkflowStatus::Failed);
    // Attempts 2 and 3 ran after recovery
    assert_eq!(calls.get(), 2);
    assert!(matches!(
        execution.failure.unwrap().kind(),
        FailureKind::Activity { attempt: 3, .. }
    ));
    worker.shutdown().await.unwrap();
}

#[test(tokio::test)]
async fn test_recovery_delivers_child_closed_before_crash() {
    let dir = tempfile::tempdir().unwrap();

    let (parent, child) = {
        let engine = file_engine(dir.path());
        let mut executor = WorkflowExecutor::new(engine.clone());
        executor.register::<CallChild>();

        let parent = engine
            .start_workflow(
                "parent",
                CallChild::TYPE,
                QUEUE,
                serde_json::to_value(ActivityCall::new("greet", json!("child"))).unwrap(),
            )
            .await
            .unwrap();
        executor.process_workflow(&parent).await.unwrap();

        let child = engine.latest_run("parent/child").await.unwrap();
        // Child closed in the record, parent never told
        engine
            .store()
            .update_execution(
                &child.id,
                keel_durable::persistence::ExecutionUpdate::closed(
                    WorkflowStatus::Completed,
                    Some(json!("Hello, child!")),
                    None,
                ),
            )
            .await
            .unwrap();
        (parent, child.id)
    };

    let engine = file_engine(dir.path());
    let report = engine.recover().await.unwrap();
    assert_eq!(report.parents_notified, 1);

    let worker = worker(&engine);
    worker.start().unwrap();

    let execution = closed(&engine, &parent).await;
    assert_eq!(execution.result, Some(json!("Hello, child!")));
    assert_eq!(
        engine.store().get_execution(&child).await.unwrap().status,
        WorkflowStatus::Completed
    );
    worker.shutdown().await.unwrap();
}
