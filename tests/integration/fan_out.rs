//! Submission tests: validation and planning.
//!
//! These tests verify that requests are validated before anything is
//! persisted and that accepted requests fan out into independent tasks.

use serde_json::Value;
use std::sync::Arc;

use taskline::core::{TaskRequest, TaskStatus};
use taskline::Error;

use crate::fixtures::{SimulatedEnvironment, TestEnv};

/// Test: One task per input with independent parameters
/// Given two inputs and a quality parameter
/// When the request is submitted
/// Then each task carries its own copy of the parameters and is New
#[tokio::test]
async fn test_fan_out_copies_params_per_task() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "alpha").await;
    let b = test.import_file("b.txt", "beta").await;

    let submission = test
        .engine
        .submit(
            TaskRequest::new("convert", vec![a.id, b.id])
                .with_param("quality", 55)
                .with_description("thumbnails"),
        )
        .await
        .unwrap();

    assert!(submission.request.is_sealed());
    assert_eq!(submission.tasks.len(), 2);
    for task in &submission.tasks {
        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(task.params.tool["quality"], Value::from(55));
        assert_eq!(task.tool_version.as_deref(), Some("convert version 1.1.12"));
        assert!(task.description.starts_with("thumbnails"));
    }

    let mut first = test.engine.task(submission.tasks[0].id).await.unwrap();
    first.params.tool.insert("quality".to_string(), Value::from(10));
    test.engine.store().save_task(&first).await.unwrap();
    let second = test.engine.task(submission.tasks[1].id).await.unwrap();
    assert_eq!(second.params.tool["quality"], Value::from(55));
}

/// Test: Schema defaults fill unset parameters
#[tokio::test]
async fn test_defaults_are_applied() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "alpha").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();

    assert_eq!(submission.request.params["quality"], Value::from(80));
    assert_eq!(submission.tasks[0].params.tool["quality"], Value::from(80));
}

/// Test: Out-of-range values are rejected together
/// Given a quality above the maximum
/// When the request is submitted
/// Then an aggregated validation error names the field and nothing is saved
#[tokio::test]
async fn test_invalid_params_are_rejected_before_persisting() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "alpha").await;

    let err = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]).with_param("quality", 500))
        .await
        .unwrap_err();

    match err {
        Error::AggregatedValidation(errors) => {
            assert_eq!(errors.messages("quality"), ["must be at most 100"]);
        }
        other => panic!("expected aggregated validation error, got {other}"),
    }
    assert!(test.engine.store().list_requests().await.unwrap().is_empty());
    assert!(test.engine.store().list_tasks().await.unwrap().is_empty());
}

/// Test: A request without inputs plans nothing
#[tokio::test]
async fn test_no_inputs_is_rejected() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;

    let err = test
        .engine
        .submit(TaskRequest::new("convert", Vec::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoQualifyingInput { .. }));
    assert!(test.engine.store().list_tasks().await.unwrap().is_empty());
}

/// Test: Unknown operations are reported by id
#[tokio::test]
async fn test_unknown_operation() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "alpha").await;

    let err = test
        .engine
        .submit(TaskRequest::new("resize", vec![a.id]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnknownOperation(ref id) if id == "resize"));
}

/// Test: Submitted requests are saved with their tasks
#[tokio::test]
async fn test_submission_is_persisted() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "alpha").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();

    let request = test
        .engine
        .store()
        .load_request(submission.request.id)
        .await
        .unwrap();
    assert!(request.is_sealed());
    assert_eq!(request.results_store_id.as_deref(), Some("local"));

    let tasks = test
        .engine
        .store()
        .tasks_for_request(request.id)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].results_store_id.as_deref(), Some("local"));
}
