//! Scheduler for concurrent task execution.
//!
//! The Scheduler runs every task of a set on its own tokio worker, starting
//! a task only once its prerequisites have completed and keeping at most
//! `max_concurrent` workers busy. Workers share nothing but the state
//! machine; each drives one task to a terminal state or until it is blocked.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::{ReasonCode, TaskDAG, TaskId, TaskStatus};
use crate::orchestration::machine::{ExecutionStateMachine, Step, WaitReason};
use crate::{Error, Result};

/// Events emitted by the scheduler for task lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A worker picked up the task.
    TaskStarted {
        task_id: TaskId,
    },
    /// The task reached Completed.
    TaskCompleted {
        task_id: TaskId,
    },
    /// The task reached a Failed* status, or its worker hit an error.
    TaskFailed {
        task_id: TaskId,
        status: Option<TaskStatus>,
        reason: Option<ReasonCode>,
        error: Option<String>,
    },
    /// The task cannot start because `prerequisite`, directly or further
    /// upstream, failed.
    TaskBlocked {
        task_id: TaskId,
        prerequisite: TaskId,
    },
    /// Nothing is left to run.
    AllTasksComplete,
}

/// What happened to each task of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub blocked: Vec<TaskId>,
    /// True when the run stopped because of a shutdown request.
    pub interrupted: bool,
}

pub struct Scheduler {
    machine: Arc<ExecutionStateMachine>,
    max_concurrent: usize,
    poll_interval: Duration,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(machine: Arc<ExecutionStateMachine>, max_concurrent: usize, poll_interval: Duration) -> Self {
        Self {
            machine,
            max_concurrent: max_concurrent.max(1),
            poll_interval,
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Token that stops the run; workers are aborted at their next await.
    ///
    /// Task state is persisted after every step, so an interrupted run can
    /// be resumed by running the same tasks again.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    /// Run `ids` to completion.
    pub async fn run(&self, ids: &[TaskId]) -> Result<SchedulerReport> {
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            tasks.push(self.machine.store().load_task(*id).await?);
        }
        let dag = TaskDAG::from_tasks(&tasks)?;

        let mut report = SchedulerReport::default();
        let mut completed: HashSet<TaskId> = HashSet::new();
        // Completed, failed, blocked or running: never launched again.
        let mut settled: HashSet<TaskId> = HashSet::new();

        for task in &tasks {
            if task.status == TaskStatus::Completed {
                completed.insert(task.id);
                settled.insert(task.id);
                report.completed.push(task.id);
            } else if task.status.is_failed() {
                settled.insert(task.id);
                report.failed.push(task.id);
            }
        }

        let mut workers: JoinSet<(TaskId, Result<Step>)> = JoinSet::new();
        let mut running = 0usize;

        loop {
            for id in dag.ready_tasks(&completed, &settled) {
                if running >= self.max_concurrent {
                    break;
                }
                settled.insert(id);
                running += 1;
                let machine = Arc::clone(&self.machine);
                let poll_interval = self.poll_interval;
                workers.spawn(async move { (id, machine.drive(id, poll_interval).await) });
                tracing::debug!(task = %id.short(), "Started worker");
                self.emit(SchedulerEvent::TaskStarted { task_id: id }).await;
            }

            // Anything downstream of a failure can never start.
            for failed in report.failed.clone() {
                for id in dag.downstream_of(&failed) {
                    if !settled.insert(id) {
                        continue;
                    }
                    report.blocked.push(id);
                    self.emit(SchedulerEvent::TaskBlocked {
                        task_id: id,
                        prerequisite: failed,
                    })
                    .await;
                }
            }

            if running == 0 {
                break;
            }

            let joined = tokio::select! {
                joined = workers.join_next() => joined,
                _ = self.cancel.cancelled() => {
                    workers.abort_all();
                    report.interrupted = true;
                    tracing::info!(running, "Scheduler shutting down");
                    return Ok(report);
                }
            };
            let Some(joined) = joined else { break };
            running -= 1;
            let (id, result) = joined.map_err(|e| Error::TaskJoin(e.to_string()))?;
            self.settle(id, result, &mut completed, &mut report).await?;
        }

        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            "Scheduler run finished"
        );
        self.emit(SchedulerEvent::AllTasksComplete).await;
        Ok(report)
    }

    async fn settle(
        &self,
        id: TaskId,
        result: Result<Step>,
        completed: &mut HashSet<TaskId>,
        report: &mut SchedulerReport,
    ) -> Result<()> {
        match result {
            Ok(Step::Terminal(TaskStatus::Completed)) => {
                completed.insert(id);
                report.completed.push(id);
                self.emit(SchedulerEvent::TaskCompleted { task_id: id }).await;
            }
            Ok(Step::Terminal(status)) => {
                let task = self.machine.store().load_task(id).await?;
                report.failed.push(id);
                self.emit(SchedulerEvent::TaskFailed {
                    task_id: id,
                    status: Some(status),
                    reason: task.failure.map(|f| f.reason),
                    error: None,
                })
                .await;
            }
            Ok(Step::Waiting(WaitReason::PrerequisiteFailed(prerequisite))) => {
                report.blocked.push(id);
                self.emit(SchedulerEvent::TaskBlocked {
                    task_id: id,
                    prerequisite,
                })
                .await;
            }
            Ok(other) => {
                // A prerequisite outside this run has not completed.
                tracing::warn!(task = %id.short(), step = ?other, "Task left waiting");
                report.blocked.push(id);
            }
            Err(e) => {
                tracing::error!(task = %id.short(), error = %e, "Worker failed");
                report.failed.push(id);
                self.emit(SchedulerEvent::TaskFailed {
                    task_id: id,
                    status: None,
                    reason: None,
                    error: Some(e.to_string()),
                })
                .await;
            }
        }
        Ok(())
    }
}
