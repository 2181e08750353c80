//! Version gating integration tests.
//!
//! `sharpen` first appeared in convert 1.1.10. These tests verify that it
//! reaches the command line only when the resolved version supports it,
//! comparing versions numerically rather than as strings.

use serde_json::Value;
use std::sync::Arc;

use taskline::core::{framework_keys, EnvironmentRef, ReasonCode, TaskRequest, TaskStatus};

use crate::fixtures::{SimulatedEnvironment, TestEnv};

async fn run_sharpen(version: &str) -> (Vec<String>, Vec<String>, Option<Value>) {
    let env = Arc::new(SimulatedEnvironment::new());
    let test = TestEnv::with_tool_version(env.clone(), version).await;
    let a = test.import_file("a.txt", "alpha").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]).with_param("sharpen", true))
        .await
        .unwrap();
    let report = test.engine.run(&submission.task_ids()).await.unwrap();
    assert_eq!(report.completed.len(), 1);

    let task = test.engine.task(submission.tasks[0].id).await.unwrap();
    let dropped = task
        .params
        .framework
        .get(framework_keys::DROPPED_OPTIONS)
        .cloned();
    let commands = env.submissions().into_iter().flatten().collect();
    (commands, submission.notices, dropped)
}

/// Test: Option supported by a newer patch release
/// Given convert 1.1.12
/// When sharpen is requested
/// Then the flag is on the command line
#[tokio::test]
async fn test_supported_option_reaches_command() {
    let (commands, _, dropped) = run_sharpen("convert version 1.1.12").await;

    assert_eq!(commands, vec!["convert a.txt a_out.txt --quality 80 --sharpen"]);
    assert!(dropped.is_none());
}

/// Test: Option missing from an older release
/// Given convert 1.1.9
/// When sharpen is requested
/// Then the flag is dropped, recorded on the task and reported to the user
#[tokio::test]
async fn test_unsupported_option_is_dropped() {
    let (commands, notices, dropped) = run_sharpen("convert version 1.1.9").await;

    assert_eq!(commands, vec!["convert a.txt a_out.txt --quality 80"]);
    assert_eq!(dropped, Some(Value::from(vec!["sharpen"])));
    assert!(notices.iter().any(|n| n.contains("sharpen")));
}

/// Test: A request may pin the version
/// Given a probe reporting 1.1.12
/// When the request pins 1.1.9
/// Then the pinned version gates the options
#[tokio::test]
async fn test_pinned_version_overrides_probe() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "alpha").await;

    let request = TaskRequest::new("convert", vec![a.id])
        .with_param("sharpen", true)
        .with_environment(EnvironmentRef {
            tool_version: Some("1.1.9".to_string()),
            ..EnvironmentRef::local()
        });
    let submission = test.engine.submit(request).await.unwrap();

    let task = &submission.tasks[0];
    assert_eq!(task.tool_version.as_deref(), Some("1.1.9"));
    assert!(!task.params.tool.contains_key("sharpen"));
}

/// Test: A version string without digits
/// Given a probe reporting no numeric version
/// When a convert task runs
/// Then gated options are dropped at submission and setup fails with MalformedVersion
#[tokio::test]
async fn test_malformed_version_fails_setup() {
    let env = Arc::new(SimulatedEnvironment::new());
    let test = TestEnv::with_tool_version(env.clone(), "convert (development build)").await;
    let a = test.import_file("a.txt", "alpha").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]).with_param("sharpen", true))
        .await
        .unwrap();
    assert!(!submission.tasks[0].params.tool.contains_key("sharpen"));

    test.engine.run(&submission.task_ids()).await.unwrap();
    let task = test.engine.task(submission.tasks[0].id).await.unwrap();
    assert_eq!(task.status, TaskStatus::FailedSetup);
    assert_eq!(task.failure.unwrap().reason, ReasonCode::MalformedVersion);
    assert!(env.submissions().is_empty());
}
