//! Cancellation integration tests.

use std::sync::Arc;
use std::time::Duration;

use taskline::core::{ReasonCode, TaskId, TaskRequest, TaskStatus};
use taskline::{Error, TaskEngine};

use crate::fixtures::{SimulatedEnvironment, TestEnv};

async fn wait_for_status(engine: &TaskEngine, id: TaskId, status: TaskStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if engine.task(id).await.map(|t| t.status).ok() == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task never reached the expected status");
}

/// Test: Cancel a running job
/// Given a job that keeps running
/// When the task is cancelled
/// Then the run ends with the task FailedExecution for reason Cancelled
#[tokio::test]
async fn test_cancel_running_task() {
    let env = Arc::new(SimulatedEnvironment::new());
    env.hold();
    let test = Arc::new(TestEnv::new(env.clone()).await);
    let a = test.import_file("a.txt", "alpha").await;
    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    let id = submission.tasks[0].id;

    let runner = {
        let test = test.clone();
        tokio::spawn(async move { test.engine.run(&[id]).await })
    };
    wait_for_status(&test.engine, id, TaskStatus::Executing).await;

    test.engine.cancel(id).await.unwrap();
    let report = runner.await.unwrap().unwrap();
    assert_eq!(report.failed, vec![id]);

    let task = test.engine.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::FailedExecution);
    assert_eq!(task.failure.unwrap().reason, ReasonCode::Cancelled);
    assert!(test.engine.ledger().records_for_task(id).is_empty());
}

/// Test: Only dispatched or executing tasks can be cancelled
#[tokio::test]
async fn test_cancel_requires_running_task() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "alpha").await;
    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();

    let err = test.engine.cancel(submission.tasks[0].id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

/// Test: Shutdown interrupts a run without losing state
/// Given a held job and a scheduler shutdown
/// When the run is resumed after releasing the job
/// Then the task completes
#[tokio::test]
async fn test_shutdown_then_resume() {
    let env = Arc::new(SimulatedEnvironment::new());
    env.hold();
    let test = Arc::new(TestEnv::new(env.clone()).await);
    let a = test.import_file("a.txt", "alpha").await;
    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    let id = submission.tasks[0].id;

    let scheduler = test.engine.scheduler();
    let shutdown = scheduler.shutdown_token();
    let runner = tokio::spawn(async move { scheduler.run(&[id]).await });
    wait_for_status(&test.engine, id, TaskStatus::Executing).await;

    shutdown.cancel();
    let report = runner.await.unwrap().unwrap();
    assert!(report.interrupted);
    assert!(report.completed.is_empty());

    env.release();
    let report = test.engine.run(&test.engine.unfinished_tasks().await.unwrap()).await.unwrap();
    assert_eq!(report.completed, vec![id]);
    assert_eq!(env.submissions().len(), 1);
}
