//! Recovery, restart and resume integration tests.
//!
//! Recovery re-enters the failed phase with the same run number. Restart
//! re-enters a finished task at any supported phase as a new run. Resume
//! picks up tasks another process left unfinished.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use taskline::cache::ArtifactStore;
use taskline::core::{Phase, ReasonCode, TaskRequest, TaskStatus};
use taskline::orchestration::{JobOutcome, Step};
use taskline::Error;

use crate::fixtures::{
    bundle_plugin, convert_plugin, produce_outputs, registry_with, ScriptedPlugin,
    SimulatedEnvironment, TestEnv,
};

const VERSION: &str = "convert version 1.1.12";

fn succeeding() -> JobOutcome {
    JobOutcome {
        exit_code: Some(0),
        ..Default::default()
    }
}

/// Test: Recover from a post-processing failure
/// Given a job that exits 0 without writing its output
/// When the output is put in place and the task is recovered
/// Then it completes with the same run number
#[tokio::test]
async fn test_recover_post_processing_keeps_run_number() {
    let env = Arc::new(SimulatedEnvironment::with_behavior(|_, _| succeeding()));
    let test = TestEnv::new(env.clone()).await;
    let a = test.import_file("a.txt", "alpha").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    let id = submission.tasks[0].id;
    test.engine.run(&[id]).await.unwrap();

    let task = test.engine.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::FailedPostProcessing);
    assert_eq!(task.failure.as_ref().unwrap().reason, ReasonCode::MissingOutput);

    std::fs::write(test.workdir_of(&task).join("a_out.txt"), "fixed by hand").unwrap();
    assert_eq!(test.engine.recover(id).await.unwrap(), TaskStatus::PostProcessing);

    let report = test.engine.run(&[id]).await.unwrap();
    assert_eq!(report.completed, vec![id]);

    let task = test.engine.task(id).await.unwrap();
    assert_eq!(task.run_number, 1);
    assert!(task.failure.is_none());
    let records = test.engine.ledger().records_for_task(id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].run_number, 1);
    // The job was not run again.
    assert_eq!(env.submissions().len(), 1);
}

/// Test: Recover from a setup failure
/// Given an operation whose first setup reports failure
/// When the task is recovered and run again
/// Then it completes under run 1
#[tokio::test]
async fn test_recover_setup_failure_keeps_run_number() {
    let env = Arc::new(SimulatedEnvironment::new());
    let plugin = ScriptedPlugin::new().failing_setup(1);
    let registry = registry_with(Arc::new(plugin), false, bundle_plugin());
    let test = TestEnv::with_registry(env.clone(), VERSION, registry).await;
    let a = test.import_file("a.txt", "alpha").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    let id = submission.tasks[0].id;
    test.engine.run(&[id]).await.unwrap();

    let task = test.engine.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::FailedSetup);
    assert_eq!(task.failure.as_ref().unwrap().reason, ReasonCode::HookReturnedFalse);
    assert!(env.submissions().is_empty());

    assert_eq!(test.engine.recover(id).await.unwrap(), TaskStatus::Setup);
    let report = test.engine.run(&[id]).await.unwrap();
    assert_eq!(report.completed, vec![id]);

    let task = test.engine.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.run_number, 1);
    assert!(task.failure.is_none());
    assert_eq!(env.submissions().len(), 1);
    assert!(test.engine.ledger().has_record_for(id, 1));
}

/// Test: Recover from an execution failure
/// Given a job that fails once and then succeeds
/// When the task is recovered
/// Then the job is resubmitted under the same run number
#[tokio::test]
async fn test_recover_execution_resubmits_job() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let env = Arc::new(SimulatedEnvironment::with_behavior(move |task, _| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return JobOutcome {
                exit_code: Some(1),
                stderr: "transient failure".to_string(),
                ..Default::default()
            };
        }
        produce_outputs(task);
        succeeding()
    }));
    let test = TestEnv::new(env.clone()).await;
    let a = test.import_file("a.txt", "alpha").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    let id = submission.tasks[0].id;
    test.engine.run(&[id]).await.unwrap();
    assert_eq!(
        test.engine.task(id).await.unwrap().status,
        TaskStatus::FailedExecution
    );

    assert_eq!(test.engine.recover(id).await.unwrap(), TaskStatus::Dispatched);
    let recovered = test.engine.task(id).await.unwrap();
    assert!(recovered.job.is_none());

    test.engine.run(&[id]).await.unwrap();
    let task = test.engine.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.run_number, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

/// Test: Restart at setup
/// Given a completed task with a stray file in its workdir
/// When it is restarted at setup and run again
/// Then the run number increments, the workdir starts empty, and the
///      output artifact gets a new version with a second derivation
#[tokio::test]
async fn test_restart_at_setup_starts_new_run() {
    let env = Arc::new(SimulatedEnvironment::new());
    let test = TestEnv::new(env.clone()).await;
    let a = test.import_file("a.txt", "alpha").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    let id = submission.tasks[0].id;
    test.engine.run(&[id]).await.unwrap();

    let task = test.engine.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let output_id = task.params.output_ids()[0];
    let first_version = test
        .engine
        .cache()
        .store()
        .describe(output_id)
        .await
        .unwrap()
        .version;
    let stray = test.workdir_of(&task).join("stray.tmp");
    std::fs::write(&stray, "left over").unwrap();

    assert_eq!(test.engine.restart_at(id, Phase::Setup).await.unwrap(), TaskStatus::Setup);
    let restarted = test.engine.task(id).await.unwrap();
    assert_eq!(restarted.run_number, 2);
    assert!(restarted.job.is_none());
    assert!(!stray.exists());

    test.engine.run(&[id]).await.unwrap();
    let task = test.engine.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.params.output_ids(), vec![output_id]);

    let output = test.engine.cache().store().describe(output_id).await.unwrap();
    assert!(output.version > first_version);
    let runs: Vec<u32> = test
        .engine
        .provenance_of(output_id)
        .iter()
        .map(|r| r.run_number)
        .collect();
    assert_eq!(runs, vec![1, 2]);
    assert_eq!(env.submissions().len(), 2);
}

/// Test: A declined restart changes nothing
/// Given a completed task whose operation declines every restart
/// When it is restarted at setup
/// Then the request is refused and the task and its workdir are untouched
#[tokio::test]
async fn test_declined_restart_keeps_task_and_workdir() {
    let env = Arc::new(SimulatedEnvironment::new());
    let plugin = ScriptedPlugin::new().declining_restart();
    let registry = registry_with(Arc::new(plugin), false, bundle_plugin());
    let test = TestEnv::with_registry(env.clone(), VERSION, registry).await;
    let a = test.import_file("a.txt", "alpha").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    let id = submission.tasks[0].id;
    test.engine.run(&[id]).await.unwrap();

    let task = test.engine.task(id).await.unwrap();
    let workdir = test.workdir_of(&task);
    let stray = workdir.join("stray.tmp");
    std::fs::write(&stray, "left over").unwrap();

    assert!(matches!(
        test.engine.restart_at(id, Phase::Setup).await,
        Err(Error::Validation(_))
    ));

    let task = test.engine.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.run_number, 1);
    assert!(stray.exists());
    assert!(workdir.join("a_out.txt").exists());
}

/// Test: A fan-in shares the first task's workdir across a restart
/// Given a fan-in configured to share the working directory
/// When the request runs and the fan-in is restarted at setup
/// Then the fan-in works in the first convert task's directory, and the
///      restart leaves that directory in place
#[tokio::test]
async fn test_shared_fan_in_workdir_survives_restart() {
    let env = Arc::new(SimulatedEnvironment::new());
    let bundle = bundle_plugin().restartable(&[Phase::Setup]);
    let registry = registry_with(Arc::new(convert_plugin()), true, bundle);
    let test = TestEnv::with_registry(env.clone(), VERSION, registry).await;
    let a = test.import_file("a.txt", "alpha").await;
    let b = test.import_file("b.txt", "beta").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id, b.id]).with_param("merge", true))
        .await
        .unwrap();
    let report = test.engine.run(&submission.task_ids()).await.unwrap();
    assert_eq!(report.completed.len(), 3);

    let first = submission.tasks[0].id;
    let bundle_id = submission
        .tasks
        .iter()
        .find(|t| t.operation == "bundle")
        .map(|t| t.id)
        .unwrap();
    let first_task = test.engine.task(first).await.unwrap();
    let bundle_task = test.engine.task(bundle_id).await.unwrap();
    assert_eq!(bundle_task.share_workdir_of, Some(first));
    assert_eq!(bundle_task.workdir, first_task.workdir);

    let shared = test.workdir_of(&first_task);
    let stray = shared.join("notes.tmp");
    std::fs::write(&stray, "keep me").unwrap();

    assert_eq!(
        test.engine.restart_at(bundle_id, Phase::Setup).await.unwrap(),
        TaskStatus::Setup
    );
    assert!(stray.exists());
    assert!(shared.join("a_out.txt").exists());

    test.engine.run(&[bundle_id]).await.unwrap();
    let bundle_task = test.engine.task(bundle_id).await.unwrap();
    assert_eq!(bundle_task.status, TaskStatus::Completed);
    assert_eq!(bundle_task.run_number, 2);
    assert_eq!(bundle_task.workdir, Some(shared));
    assert_eq!(
        test.engine.task(first).await.unwrap().status,
        TaskStatus::Completed
    );
}

/// Test: Restart at post-processing reuses the job's results
#[tokio::test]
async fn test_restart_at_post_processing_keeps_workdir() {
    let env = Arc::new(SimulatedEnvironment::new());
    let test = TestEnv::new(env.clone()).await;
    let a = test.import_file("a.txt", "alpha").await;

    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    let id = submission.tasks[0].id;
    test.engine.run(&[id]).await.unwrap();

    test.engine.restart_at(id, Phase::PostProcessing).await.unwrap();
    test.engine.run(&[id]).await.unwrap();

    let task = test.engine.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.run_number, 2);
    assert!(task.job.is_some());
    assert_eq!(env.submissions().len(), 1);
    assert!(test.engine.ledger().has_record_for(id, 2));
}

/// Test: Illegal recovery and restart requests are refused
#[tokio::test]
async fn test_recover_and_restart_preconditions() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "alpha").await;
    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]).with_param("merge", true))
        .await
        .unwrap();
    let convert = submission.tasks[0].id;
    let bundle = submission.tasks[1].id;

    // Not finished yet.
    assert!(matches!(
        test.engine.restart_at(convert, Phase::Setup).await,
        Err(Error::InvalidTransition { .. })
    ));

    test.engine.run(&submission.task_ids()).await.unwrap();

    // Completed is not a failure.
    assert!(matches!(
        test.engine.recover(convert).await,
        Err(Error::InvalidTransition { .. })
    ));
    // The bundle operation supports no restart.
    assert!(matches!(
        test.engine.restart_at(bundle, Phase::Setup).await,
        Err(Error::RestartUnsupported { .. })
    ));
    assert_eq!(test.engine.task(bundle).await.unwrap().run_number, 1);
}

/// Test: Resume after the process went away
/// Given a task advanced to Dispatched by one engine
/// When a new engine opens the same directories
/// Then the task is listed as unfinished and runs to completion
#[tokio::test]
async fn test_resume_unfinished_task_in_new_engine() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "alpha").await;
    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    let id = submission.tasks[0].id;

    let machine = test.engine.machine();
    assert_eq!(machine.advance(id).await.unwrap(), Step::Advanced(TaskStatus::Setup));
    assert_eq!(
        machine.advance(id).await.unwrap(),
        Step::Advanced(TaskStatus::Dispatched)
    );

    let env = Arc::new(SimulatedEnvironment::new());
    let engine = test.reopen(env.clone()).await;
    assert_eq!(engine.unfinished_tasks().await.unwrap(), vec![id]);

    let report = engine.run(&[id]).await.unwrap();
    assert_eq!(report.completed, vec![id]);
    assert_eq!(env.submissions().len(), 1);
    assert_eq!(engine.ledger().records_for_task(id).len(), 1);
}
