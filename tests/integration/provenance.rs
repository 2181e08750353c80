//! Provenance ledger integration tests.
//!
//! The ledger is shared by every engine opened over the same state
//! directory, and saving results for a run happens at most once.

use std::sync::Arc;

use taskline::core::{TaskRequest, TaskStatus};
use taskline::orchestration::Step;
use taskline::TaskEngine;

use crate::fixtures::{registry, SimulatedEnvironment, TestEnv};

/// Test: Two engines over one state directory keep both derivations
/// Given two engines opened on the same configuration
/// When each runs one convert task
/// Then a reopened engine sees both derivation records
#[tokio::test]
async fn test_engines_sharing_state_keep_every_record() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let other = TaskEngine::open(
        test.engine.config().clone(),
        registry(),
        Arc::new(SimulatedEnvironment::new()),
    )
    .await
    .unwrap();

    let a = test.import_file("a.txt", "alpha").await;
    let b_path = test.path().join("incoming").join("b.txt");
    std::fs::write(&b_path, "beta").unwrap();
    let b = other.import(&b_path, None).await.unwrap();

    let first = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    let second = other
        .submit(TaskRequest::new("convert", vec![b.id]))
        .await
        .unwrap();
    let first_ids = first.task_ids();
    let second_ids = second.task_ids();
    assert_eq!(test.engine.run(&first_ids).await.unwrap().completed, first_ids);
    assert_eq!(other.run(&second_ids).await.unwrap().completed, second_ids);

    // Each engine only knows its own record in memory.
    assert_eq!(test.engine.ledger().len(), 1);
    assert_eq!(other.ledger().len(), 1);

    let reopened = test.reopen(Arc::new(SimulatedEnvironment::new())).await;
    assert_eq!(reopened.ledger().len(), 2);
    assert_eq!(reopened.ledger().records_for_task(first_ids[0]).len(), 1);
    assert_eq!(reopened.ledger().records_for_task(second_ids[0]).len(), 1);
}

/// Test: Replaying post-processing saves nothing twice
/// Given a task record restored to PostProcessing after the task completed
/// When the state machine advances it again
/// Then it completes with the same output, one derivation and no new artifact
#[tokio::test]
async fn test_replayed_post_processing_is_idempotent() {
    let test = TestEnv::new(Arc::new(SimulatedEnvironment::new())).await;
    let a = test.import_file("a.txt", "alpha").await;
    let submission = test
        .engine
        .submit(TaskRequest::new("convert", vec![a.id]))
        .await
        .unwrap();
    let id = submission.tasks[0].id;
    let machine = test.engine.machine();

    let mut steps = 0;
    while test.engine.task(id).await.unwrap().status != TaskStatus::PostProcessing {
        steps += 1;
        assert!(steps < 50, "task never reached post-processing");
        machine.advance(id).await.unwrap();
    }

    let path = test
        .engine
        .store()
        .root()
        .join("tasks")
        .join(format!("{}.json", id));
    let snapshot = std::fs::read_to_string(&path).unwrap();

    assert_eq!(
        machine.advance(id).await.unwrap(),
        Step::Terminal(TaskStatus::Completed)
    );
    let completed = test.engine.task(id).await.unwrap();
    let outputs = completed.params.output_ids();
    assert_eq!(outputs.len(), 1);

    std::fs::write(&path, snapshot).unwrap();
    assert_eq!(
        machine.advance(id).await.unwrap(),
        Step::Terminal(TaskStatus::Completed)
    );

    let replayed = test.engine.task(id).await.unwrap();
    assert_eq!(replayed.status, TaskStatus::Completed);
    assert_eq!(replayed.params.output_ids(), outputs);
    let records = test.engine.ledger().records_for_task(id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outputs, outputs);
    // The input and one output.
    assert_eq!(test.engine.artifacts().await.unwrap().len(), 2);
    assert_eq!(test.engine.provenance_of(outputs[0]).len(), 1);
}
