//! File sync cache integration tests.
//!
//! These tests verify that concurrent tasks staging the same artifact
//! share one transfer, and that new durable versions are fetched again.

use std::sync::Arc;
use tempfile::TempDir;

use taskline::cache::{ArtifactStore, DestageTarget};
use taskline::core::{SyncStatus, TaskRequest, TaskStatus};
use taskline::TaskEngine;

use crate::fixtures::{registry, test_config, SimulatedEnvironment, TestEnv};

/// Test: Concurrent tasks share one transfer
/// Given two requests over the same input
/// When both run at the same time
/// Then the input is transferred into the cache once
#[tokio::test]
async fn test_concurrent_tasks_share_transfer() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "alpha").await;

    let first = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    let second = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]).with_param("quality", 20))
        .await
        .unwrap();

    let first_ids = first.task_ids();
    let second_ids = second.task_ids();
    let (r1, r2) = tokio::join!(test.engine.run(&first_ids), test.engine.run(&second_ids));
    assert_eq!(r1.unwrap().completed.len(), 1);
    assert_eq!(r2.unwrap().completed.len(), 1);

    assert_eq!(test.engine.cache().transfer_count(), 1);
    assert_eq!(test.engine.cache().status(a.id), SyncStatus::InSync);
}

/// Test: A new durable version invalidates the cached copy
/// Given an input already in the cache
/// When its content is republished
/// Then the next task sees the new content after one more transfer
#[tokio::test]
async fn test_republished_input_is_fetched_again() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "first").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    test.engine.run(&submission.task_ids()).await.unwrap();
    assert_eq!(test.engine.cache().transfer_count(), 1);

    let replacement = test.path().join("a.txt");
    std::fs::write(&replacement, "second").unwrap();
    let updated = test
        .engine
        .cache()
        .store()
        .publish(&replacement, &DestageTarget::Existing(a.id))
        .await
        .unwrap();
    assert!(updated.version > a.version);
    assert!(!test.engine.cache().is_local(a.id).await.unwrap());

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    test.engine.run(&submission.task_ids()).await.unwrap();

    assert_eq!(test.engine.cache().transfer_count(), 2);
    assert_eq!(
        test.engine.cache().sync_state(a.id).synced_version,
        updated.version
    );
    let task = test.engine.task(submission.tasks[0].id).await.unwrap();
    let output = test
        .engine
        .cache()
        .store()
        .describe(task.params.output_ids()[0])
        .await
        .unwrap();
    assert_eq!(test.read_artifact(&output).await, "SECOND");
}

/// Test: Copy mode stages real files
/// Given `copy_inputs = true`
/// When a task is set up
/// Then its input is a regular file, not a link into the cache
#[tokio::test]
async fn test_copy_mode_stages_regular_files() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(temp_dir.path(), "1.1.12");
    config.copy_inputs = true;
    let engine = TaskEngine::open(config, registry(), Arc::new(SimulatedEnvironment::new()))
        .await
        .unwrap();

    let source = temp_dir.path().join("a.txt");
    std::fs::write(&source, "alpha").unwrap();
    let a = engine.import(&source, None).await.unwrap();

    let submission = engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    engine.run(&submission.task_ids()).await.unwrap();

    let task = engine.task(submission.tasks[0].id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let staged = task.workdir.unwrap().join("a.txt");
    let meta = std::fs::symlink_metadata(&staged).unwrap();
    assert!(meta.file_type().is_file());
    assert_eq!(std::fs::read_to_string(staged).unwrap(), "alpha");
}
