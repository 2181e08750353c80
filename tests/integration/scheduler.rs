//! Scheduler integration tests.
//!
//! These tests verify prerequisite ordering: the fan-in task runs only
//! after every fanned-out task completed, and is blocked when one failed.

use std::sync::Arc;
use tokio::sync::mpsc;

use taskline::cache::ArtifactStore;
use taskline::core::{ArtifactKind, TaskRequest, TaskStatus};
use taskline::orchestration::{JobOutcome, SchedulerEvent};

use crate::fixtures::{produce_outputs, SimulatedEnvironment, TestEnv};

/// Test: Fan-in after fan-out
/// Given three inputs and `merge = true`
/// When the request runs
/// Then the bundle task completes last and collects all three outputs
#[tokio::test]
async fn test_fan_in_collects_every_output() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "alpha").await;
    let b = test.import_file("b.txt", "beta").await;
    let c = test.import_file("c.txt", "gamma").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id, b.id, c.id]).with_param("merge", true))
        .await
        .unwrap();
    assert_eq!(submission.tasks.len(), 4);
    let bundle = submission.tasks.last().unwrap().clone();
    assert_eq!(bundle.operation, "bundle");
    assert_eq!(bundle.prerequisites.len(), 3);
    assert!(bundle.inputs.is_empty());

    let (tx, mut rx) = mpsc::channel(64);
    let report = test
        .engine
        .scheduler()
        .with_events(tx)
        .run(&submission.task_ids())
        .await
        .unwrap();
    assert_eq!(report.completed.len(), 4);
    assert_eq!(report.completed.last(), Some(&bundle.id));

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.last(), Some(&SchedulerEvent::AllTasksComplete));
    let bundle_started = events
        .iter()
        .position(|e| *e == SchedulerEvent::TaskStarted { task_id: bundle.id })
        .unwrap();
    for task in &submission.tasks[..3] {
        let completed = events
            .iter()
            .position(|e| *e == SchedulerEvent::TaskCompleted { task_id: task.id })
            .unwrap();
        assert!(completed < bundle_started);
    }

    let bundle = test.engine.task(bundle.id).await.unwrap();
    let output = test
        .engine
        .cache()
        .store()
        .describe(bundle.params.output_ids()[0])
        .await
        .unwrap();
    assert_eq!(output.kind, ArtifactKind::Collection);
    let dir = test.engine.cache().ensure_local(output.id).await.unwrap();
    let mut members: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    members.sort();
    assert_eq!(members, vec!["a_out.txt", "b_out.txt", "c_out.txt"]);

    let records = test.engine.provenance_of(output.id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].inputs.len(), 3);
}

/// Test: A failed prerequisite blocks the fan-in
/// Given one input whose job fails
/// When the request runs
/// Then the other tasks complete and the bundle task stays New, blocked
#[tokio::test]
async fn test_failed_prerequisite_blocks_fan_in() {
    let env = Arc::new(SimulatedEnvironment::with_behavior(|task, _| {
        let is_b = task
            .workdir
            .as_ref()
            .is_some_and(|dir| dir.join("b.txt").exists());
        if is_b {
            return JobOutcome {
                exit_code: Some(2),
                ..Default::default()
            };
        }
        produce_outputs(task);
        JobOutcome {
            exit_code: Some(0),
            ..Default::default()
        }
    }));
    let test = TestEnv::new(env).await;
    let a = test.import_file("a.txt", "alpha").await;
    let b = test.import_file("b.txt", "beta").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id, b.id]).with_param("merge", true))
        .await
        .unwrap();
    let bundle = submission.tasks.last().unwrap().id;

    let (tx, mut rx) = mpsc::channel(64);
    let report = test
        .engine
        .scheduler()
        .with_events(tx)
        .run(&submission.task_ids())
        .await
        .unwrap();

    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.blocked, vec![bundle]);
    assert_eq!(test.engine.task(bundle).await.unwrap().status, TaskStatus::New);

    let mut blocked_on = None;
    while let Ok(event) = rx.try_recv() {
        if let SchedulerEvent::TaskBlocked { task_id, prerequisite } = event {
            assert_eq!(task_id, bundle);
            blocked_on = Some(prerequisite);
        }
    }
    assert_eq!(blocked_on, Some(report.failed[0]));
}

/// Test: Finished tasks are not run again
#[tokio::test]
async fn test_completed_tasks_are_skipped() {
    let env = Arc::new(SimulatedEnvironment::new());
    let test = TestEnv::new(env.clone()).await;
    let a = test.import_file("a.txt", "alpha").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    test.engine.run_request(submission.request.id).await.unwrap();
    let report = test.engine.run_request(submission.request.id).await.unwrap();

    assert_eq!(report.completed, submission.task_ids());
    assert_eq!(env.submissions().len(), 1);
}
