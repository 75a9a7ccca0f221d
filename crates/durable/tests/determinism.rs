//! Replay determinism: identical replays, divergence detection and
//! duplicate event rejection.

mod common;

use common::*;
use keel_durable::engine::{replay_history, WorkflowRegistry};
use keel_durable::persistence::ConflictError;
use keel_durable::prelude::*;
use keel_durable::workflow::{EventKind, NewEvent};

fn executor(engine: &Arc<Engine>) -> WorkflowExecutor {
    let mut executor = WorkflowExecutor::new(engine.clone());
    executor.register::<CallActivity>();
    executor.register::<Tagged>();
    executor
}

/// Tags its activity input with a workflow-generated id
struct Tagged;

impl Workflow for Tagged {
    const TYPE: &'static str = "tagged";
    type Input = ();
    type Output = Value;

    fn new(_input: ()) -> Self {
        Self
    }

    fn on_start(&mut self, ctx: &mut WorkflowContext) -> WorkflowStep {
        let tag = ctx.new_uuid();
        let roll = ctx.random_u64();
        Ok(vec![WorkflowAction::schedule_activity(
            "greet",
            "greet",
            json!({ "tag": tag, "roll": roll, "at": ctx.now() }),
        )])
    }

    fn on_activity_resolved(
        &mut self,
        _ctx: &mut WorkflowContext,
        _activity_id: &str,
        result: Result<Value, Failure>,
    ) -> WorkflowStep {
        Ok(vec![WorkflowAction::complete(result?)])
    }
}

/// Same type name as [`CallActivity`], different activity type
struct RenamedActivity;

impl Workflow for RenamedActivity {
    const TYPE: &'static str = "call_activity";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::schedule_activity(
            "call",
            "shout",
            json!(null),
        )])
    }

    fn on_activity_resolved(
        &mut self,
        _ctx: &mut WorkflowContext,
        _activity_id: &str,
        result: Result<Value, Failure>,
    ) -> WorkflowStep {
        Ok(vec![WorkflowAction::complete(result?)])
    }
}

/// Same type name as [`CallActivity`], different activity id
struct RenamedId;

impl Workflow for RenamedId {
    const TYPE: &'static str = "call_activity";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::schedule_activity(
            "renamed",
            "greet",
            json!(null),
        )])
    }

    fn on_activity_resolved(
        &mut self,
        _ctx: &mut WorkflowContext,
        _activity_id: &str,
        result: Result<Value, Failure>,
    ) -> WorkflowStep {
        Ok(vec![WorkflowAction::complete(result?)])
    }
}

async fn complete_next_activity(engine: &Engine, result: Value) {
    let task = engine
        .queues()
        .poll_activity(QUEUE, |_| true)
        .expect("an activity task is queued");
    engine
        .record_activity_result(&task, Ok(result))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_replaying_twice_yields_identical_commands() {
    let engine = memory_engine();
    let executor = executor(&engine);
    let id = engine
        .start_workflow("tagged", "tagged", QUEUE, json!(null))
        .await
        .unwrap();
    executor.process_workflow(&id).await.unwrap();
    complete_next_activity(&engine, json!("done")).await;

    let history = engine.store().load_events(&id).await.unwrap();
    let mut registry = WorkflowRegistry::new();
    registry.register::<Tagged>();

    let replay = || {
        let mut workflow = registry.create("tagged", json!(null)).unwrap();
        replay_history(workflow.as_mut(), &id, &history, None).unwrap()
    };
    let first = replay();
    let second = replay();

    assert_eq!(first, second);
    assert!(matches!(
        first.commands.as_slice(),
        [WorkflowAction::CompleteWorkflow { .. }]
    ));
}

#[tokio::test]
async fn test_generated_values_are_stable_across_ticks() {
    let engine = memory_engine();
    let executor = executor(&engine);
    let id = engine
        .start_workflow("tagged", "tagged", QUEUE, json!(null))
        .await
        .unwrap();

    executor.process_workflow(&id).await.unwrap();
    let task = engine.queues().poll_activity(QUEUE, |_| true).unwrap();
    engine
        .record_activity_result(&task, Ok(task.input.clone()))
        .await
        .unwrap();
    executor.process_workflow(&id).await.unwrap();

    let execution = engine.store().get_execution(&id).await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Completed);
    // The result echoes what the first tick generated
    assert_eq!(execution.result, Some(task.input));
}

#[tokio::test]
async fn test_changed_activity_type_is_non_deterministic() {
    let engine = memory_engine();
    let id = engine
        .start_workflow(
            "diverge",
            "call_activity",
            QUEUE,
            json!({ "activity_type": "greet", "input": "World" }),
        )
        .await
        .unwrap();
    executor(&engine).process_workflow(&id).await.unwrap();

    let mut changed = WorkflowExecutor::new(engine.clone());
    changed.register::<RenamedActivity>();
    let result = changed.process_workflow(&id).await;

    assert!(matches!(result, Err(ExecutorError::NonDeterminism(_))));
    let execution = engine.store().get_execution(&id).await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Running);
    assert_eq!(engine.store().load_events(&id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_missing_recorded_command_is_non_deterministic() {
    let engine = memory_engine();
    let id = engine
        .start_workflow(
            "diverge",
            "call_activity",
            QUEUE,
            json!({ "activity_type": "greet", "input": "World" }),
        )
        .await
        .unwrap();
    executor(&engine).process_workflow(&id).await.unwrap();

    let mut changed = WorkflowExecutor::new(engine.clone());
    changed.register::<RenamedId>();
    let result = changed.process_workflow(&id).await;

    assert!(matches!(result, Err(ExecutorError::NonDeterminism(_))));
}

#[tokio::test]
async fn test_duplicate_event_is_rejected() {
    let engine = memory_engine();
    let id = engine
        .start_workflow("dup", "call_activity", QUEUE, json!(null))
        .await
        .unwrap();
    let store = engine.store();
    let before = store.load_events(&id).await.unwrap();

    let next = store.next_sequence(&id).await.unwrap();
    let result = store
        .append_event(&id, next, NewEvent::new(before[0].kind.clone()))
        .await;

    assert!(matches!(
        result,
        Err(StoreError::Conflict(ConflictError::DuplicateEvent { .. }))
    ));
    assert_eq!(store.load_events(&id).await.unwrap(), before);
}

#[tokio::test]
async fn test_second_close_is_rejected() {
    let engine = memory_engine();
    let executor = executor(&engine);
    let id = engine
        .start_workflow(
            "close",
            "call_activity",
            QUEUE,
            json!({ "activity_type": "greet", "input": "World" }),
        )
        .await
        .unwrap();
    executor.process_workflow(&id).await.unwrap();
    complete_next_activity(&engine, json!("Hello, World!")).await;
    executor.process_workflow(&id).await.unwrap();

    let store = engine.store();
    let next = store.next_sequence(&id).await.unwrap();
    let result = store
        .append_event(
            &id,
            next,
            NewEvent::new(EventKind::WorkflowFailed {
                failure: Failure::application("late"),
            }),
        )
        .await;
    assert!(result.unwrap_err().is_duplicate_event());
}
