//! Per-task execution state machine.
//!
//! ```text
//! New -> Setup -> Dispatched -> Executing -> PostProcessing -> Completed
//!          |          |             |               |
//!     FailedSetup  FailedExecution  FailedExecution  FailedPostProcessing
//! ```
//!
//! Every call to [`ExecutionStateMachine::advance`] reloads the task from
//! the state store, performs at most one phase step and persists the result
//! before returning. A worker can therefore die at any point and another
//! one can pick the task up from disk.
//!
//! Recovery re-enters the failed phase with the same run number. Restart
//! re-enters any phase of a finished task with the next run number.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::FileSyncCache;
use crate::core::{ConcreteTask, Phase, ReasonCode, TaskId, TaskStatus};
use crate::orchestration::environment::{ExecutionEnvironment, JobOutcome, JobState};
use crate::plugin::{HookContext, PREREQUISITE_OUTPUTS};
use crate::provenance::ProvenanceLedger;
use crate::registry::{OperationDescriptor, OperationRegistry};
use crate::state::StateStore;
use crate::util::{self, blocking};
use crate::version::ToolVersion;
use crate::{Error, Result};

/// Log lines attached to a setup or post-processing failure.
const LOG_TAIL_LINES: usize = 20;
/// Output lines attached to an execution failure.
const OUTPUT_TAIL_LINES: usize = 40;

/// Why a task could not move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Some prerequisite has not completed yet.
    Prerequisites,
    /// A prerequisite failed; the task stays New until it is recovered.
    PrerequisiteFailed(TaskId),
    /// The submitted job is still queued or running.
    Job,
}

/// Result of one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Advanced(TaskStatus),
    Waiting(WaitReason),
    Terminal(TaskStatus),
}

pub struct ExecutionStateMachine {
    registry: Arc<OperationRegistry>,
    cache: Arc<FileSyncCache>,
    ledger: Arc<ProvenanceLedger>,
    environment: Arc<dyn ExecutionEnvironment>,
    store: Arc<StateStore>,
    work_root: PathBuf,
}

impl ExecutionStateMachine {
    pub fn new(
        registry: Arc<OperationRegistry>,
        cache: Arc<FileSyncCache>,
        ledger: Arc<ProvenanceLedger>,
        environment: Arc<dyn ExecutionEnvironment>,
        store: Arc<StateStore>,
        work_root: PathBuf,
    ) -> Self {
        Self {
            registry,
            cache,
            ledger,
            environment,
            store,
            work_root,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<ProvenanceLedger> {
        &self.ledger
    }

    /// Perform the next step for `id` and persist it.
    pub async fn advance(&self, id: TaskId) -> Result<Step> {
        let mut task = self.store.load_task(id).await?;

        let step = match task.status {
            TaskStatus::New => self.start(&mut task).await?,
            TaskStatus::Setup => self.setup(&mut task).await?,
            TaskStatus::Dispatched => self.dispatch(&mut task).await?,
            TaskStatus::Executing => self.execute(&mut task).await?,
            TaskStatus::PostProcessing => self.post_process(&mut task).await?,
            status => return Ok(Step::Terminal(status)),
        };

        if self.ledger.has_pending() {
            self.store.save_ledger(&self.ledger).await?;
        }
        self.store.save_task(&task).await?;

        Ok(match step {
            Step::Advanced(status) if status.is_terminal() => Step::Terminal(status),
            other => other,
        })
    }

    /// Advance until the task finishes or is blocked on a prerequisite.
    pub async fn drive(&self, id: TaskId, poll_interval: Duration) -> Result<Step> {
        loop {
            match self.advance(id).await? {
                Step::Advanced(_) => {}
                Step::Waiting(WaitReason::Job) => tokio::time::sleep(poll_interval).await,
                done => return Ok(done),
            }
        }
    }

    fn descriptor(&self, task: &ConcreteTask) -> Result<Arc<OperationDescriptor>> {
        self.registry.get(&task.operation)
    }

    fn tool_version(
        task: &ConcreteTask,
        descriptor: &OperationDescriptor,
    ) -> std::result::Result<Option<ToolVersion>, String> {
        match (&task.tool_version, &descriptor.tool) {
            (Some(raw), _) => ToolVersion::parse(raw).map(Some).map_err(|e| e.to_string()),
            (None, Some(tool)) => Err(format!("No version was resolved for {}", tool)),
            (None, None) => Ok(None),
        }
    }

    async fn start(&self, task: &mut ConcreteTask) -> Result<Step> {
        let mut pending = false;
        for prerequisite in &task.prerequisites {
            let other = self.store.load_task(*prerequisite).await?;
            if other.status.is_failed() {
                return Ok(Step::Waiting(WaitReason::PrerequisiteFailed(other.id)));
            }
            if other.status != TaskStatus::Completed {
                pending = true;
            }
        }
        if pending {
            return Ok(Step::Waiting(WaitReason::Prerequisites));
        }
        task.transition(TaskStatus::Setup, None)?;
        Ok(Step::Advanced(TaskStatus::Setup))
    }

    /// Use the shared task's workdir, or create this task's own.
    async fn prepare_workdir(&self, task: &mut ConcreteTask) -> Result<PathBuf> {
        if let Some(dir) = &task.workdir {
            tokio::fs::create_dir_all(dir).await?;
            return Ok(dir.clone());
        }
        let dir = match task.share_workdir_of {
            Some(other) => self
                .store
                .load_task(other)
                .await?
                .workdir
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "Task {} has no working directory to share",
                        other.short()
                    ))
                })?,
            None => self.work_root.join(task.id.to_string()),
        };
        tokio::fs::create_dir_all(&dir).await?;
        task.workdir = Some(dir.clone());
        Ok(dir)
    }

    async fn collect_prerequisite_outputs(&self, task: &mut ConcreteTask) -> Result<()> {
        if task.prerequisites.is_empty() {
            return Ok(());
        }
        let mut outputs = Vec::new();
        for prerequisite in &task.prerequisites {
            let other = self.store.load_task(*prerequisite).await?;
            outputs.extend(
                other
                    .params
                    .output_ids()
                    .into_iter()
                    .map(|id| Value::String(id.to_string())),
            );
        }
        task.params
            .framework
            .insert(PREREQUISITE_OUTPUTS.to_string(), Value::Array(outputs));
        Ok(())
    }

    async fn setup(&self, task: &mut ConcreteTask) -> Result<Step> {
        let descriptor = self.descriptor(task)?;
        let version = match Self::tool_version(task, &descriptor) {
            Ok(version) => version,
            Err(message) => {
                task.fail(Phase::Setup, ReasonCode::MalformedVersion, message, "")?;
                return Ok(Step::Advanced(task.status));
            }
        };

        if let Err(e) = self.prepare_workdir(task).await {
            let tail = task.log_tail(LOG_TAIL_LINES);
            task.fail(Phase::Setup, ReasonCode::HookError, e.to_string(), tail)?;
            return Ok(Step::Advanced(task.status));
        }
        self.collect_prerequisite_outputs(task).await?;

        let result = {
            let mut ctx = HookContext {
                task: &mut *task,
                cache: &self.cache,
                ledger: &self.ledger,
                version: version.as_ref(),
                outcome: None,
            };
            descriptor.plugin.setup(&mut ctx).await
        };

        match result {
            Ok(true) => {
                task.params.reserve_output_id();
                task.transition(TaskStatus::Dispatched, None)?;
                tracing::info!(task = %task.id.short(), run = task.run_number, "Setup complete");
            }
            Ok(false) => {
                let tail = task.log_tail(LOG_TAIL_LINES);
                task.fail(
                    Phase::Setup,
                    ReasonCode::HookReturnedFalse,
                    "setup reported failure",
                    tail,
                )?;
            }
            Err(e) => {
                let tail = task.log_tail(LOG_TAIL_LINES);
                task.fail(Phase::Setup, ReasonCode::HookError, e.to_string(), tail)?;
            }
        }
        Ok(Step::Advanced(task.status))
    }

    async fn dispatch(&self, task: &mut ConcreteTask) -> Result<Step> {
        let descriptor = self.descriptor(task)?;

        if let Some(job) = task.job.clone() {
            return match self.environment.poll(&job).await? {
                JobState::Queued => Ok(Step::Waiting(WaitReason::Job)),
                _ => {
                    task.transition(TaskStatus::Executing, None)?;
                    Ok(Step::Advanced(TaskStatus::Executing))
                }
            };
        }

        let version = match Self::tool_version(task, &descriptor) {
            Ok(version) => version,
            Err(message) => {
                task.fail(Phase::Execute, ReasonCode::MalformedVersion, message, "")?;
                return Ok(Step::Advanced(task.status));
            }
        };
        let commands = match descriptor.plugin.build_commands(task, version.as_ref()) {
            Ok(commands) => commands,
            Err(e) => {
                task.fail(Phase::Execute, ReasonCode::HookError, e.to_string(), "")?;
                return Ok(Step::Advanced(task.status));
            }
        };

        if commands.is_empty() {
            task.add_log("No job to run");
            task.transition(TaskStatus::PostProcessing, Some("no job"))?;
            return Ok(Step::Advanced(TaskStatus::PostProcessing));
        }

        let walltime = descriptor.plugin.estimate_walltime(task);
        match self.environment.submit(task, &commands, walltime).await {
            Ok(job) => {
                task.add_log(&format!(
                    "Submitted {} command(s) to {} as {}",
                    commands.len(),
                    job.environment,
                    job.id
                ));
                task.job = Some(job);
                Ok(Step::Waiting(WaitReason::Job))
            }
            Err(e) => {
                task.fail(Phase::Execute, ReasonCode::SubmissionFailed, e.to_string(), "")?;
                Ok(Step::Advanced(task.status))
            }
        }
    }

    async fn execute(&self, task: &mut ConcreteTask) -> Result<Step> {
        let Some(job) = task.job.clone() else {
            task.fail(
                Phase::Execute,
                ReasonCode::SubmissionFailed,
                "no job handle recorded",
                "",
            )?;
            return Ok(Step::Advanced(task.status));
        };

        match self.environment.poll(&job).await? {
            JobState::Queued | JobState::Running => Ok(Step::Waiting(WaitReason::Job)),
            JobState::Cancelled => {
                let outcome = self.environment.outcome(&job).await.unwrap_or_default();
                task.fail(
                    Phase::Execute,
                    ReasonCode::Cancelled,
                    "job was cancelled by the execution environment",
                    outcome.diagnostics(OUTPUT_TAIL_LINES),
                )?;
                Ok(Step::Advanced(task.status))
            }
            JobState::Exited { .. } => {
                let descriptor = self.descriptor(task)?;
                let outcome = self.environment.outcome(&job).await?;
                if descriptor.plugin.success_predicate(&outcome) {
                    task.add_log("Job finished successfully");
                    task.transition(TaskStatus::PostProcessing, None)?;
                } else {
                    let (reason, message) = failure_reason(&outcome);
                    task.fail(
                        Phase::Execute,
                        reason,
                        message,
                        outcome.diagnostics(OUTPUT_TAIL_LINES),
                    )?;
                }
                Ok(Step::Advanced(task.status))
            }
        }
    }

    async fn post_process(&self, task: &mut ConcreteTask) -> Result<Step> {
        let descriptor = self.descriptor(task)?;

        // Results of this run were saved before the task record was.
        if self.ledger.has_record_for(task.id, task.run_number) {
            for record in self.ledger.records_for_task(task.id) {
                if record.run_number == task.run_number {
                    record.outputs.iter().for_each(|id| task.params.push_output_id(*id));
                }
            }
            task.add_log("Results of this run were already saved");
            task.transition(TaskStatus::Completed, None)?;
            tracing::info!(task = %task.id.short(), run = task.run_number, "Task completed on replay");
            return Ok(Step::Advanced(TaskStatus::Completed));
        }
        let version = match Self::tool_version(task, &descriptor) {
            Ok(version) => version,
            Err(message) => {
                task.fail(Phase::PostProcessing, ReasonCode::MalformedVersion, message, "")?;
                return Ok(Step::Advanced(task.status));
            }
        };
        let outcome = match &task.job {
            Some(job) => self.environment.outcome(job).await.ok(),
            None => None,
        };

        let result = {
            let mut ctx = HookContext {
                task: &mut *task,
                cache: &self.cache,
                ledger: &self.ledger,
                version: version.as_ref(),
                outcome: outcome.as_ref(),
            };
            descriptor.plugin.save_results(&mut ctx).await
        };

        match result {
            Ok(true) => {
                if !descriptor.side_effect_free
                    && !self.ledger.has_record_for(task.id, task.run_number)
                {
                    let tail = task.log_tail(LOG_TAIL_LINES);
                    task.fail(
                        Phase::PostProcessing,
                        ReasonCode::MissingProvenance,
                        format!("no derivation was recorded for run {}", task.run_number),
                        tail,
                    )?;
                } else {
                    task.transition(TaskStatus::Completed, None)?;
                    tracing::info!(task = %task.id.short(), run = task.run_number, "Task completed");
                }
            }
            Ok(false) => {
                let tail = task.log_tail(LOG_TAIL_LINES);
                task.fail(
                    Phase::PostProcessing,
                    ReasonCode::HookReturnedFalse,
                    "saving results reported failure",
                    tail,
                )?;
            }
            Err(e) => {
                let reason = match e {
                    Error::MissingOutput(_) => ReasonCode::MissingOutput,
                    _ => ReasonCode::HookError,
                };
                task.add_log(&e.to_string());
                let tail = task.log_tail(LOG_TAIL_LINES);
                task.fail(Phase::PostProcessing, reason, e.to_string(), tail)?;
            }
        }
        Ok(Step::Advanced(task.status))
    }

    /// Resume a failed task in the phase it failed in.
    ///
    /// The run number is unchanged. Returns the resulting status, which is
    /// still the failed one if the plugin declined.
    pub async fn recover(&self, id: TaskId) -> Result<TaskStatus> {
        let mut task = self.store.load_task(id).await?;
        let Some(phase) = task.status.failed_phase() else {
            return Err(Error::InvalidTransition {
                from: task.status.to_string(),
                to: "recovery".to_string(),
            });
        };
        let descriptor = self.descriptor(&task)?;
        if !descriptor.plugin.supports_recovery(phase) {
            return Err(Error::RecoveryUnsupported {
                operation: task.operation.clone(),
                phase,
            });
        }

        if phase == Phase::Setup || task.workdir.is_some() {
            self.prepare_workdir(&mut task).await?;
        }
        let version = Self::tool_version(&task, &descriptor).ok().flatten();
        let result = {
            let mut ctx = HookContext {
                task: &mut task,
                cache: &self.cache,
                ledger: &self.ledger,
                version: version.as_ref(),
                outcome: None,
            };
            descriptor.plugin.recover_from_failure(phase, &mut ctx).await
        };

        match result {
            Ok(true) => {
                if phase == Phase::Execute {
                    task.job = None;
                }
                task.failure = None;
                task.transition(phase.entry_status(), Some("recovered"))?;
                task.add_log(&format!("Recovered from {} failure", phase));
                tracing::info!(task = %task.id.short(), %phase, run = task.run_number, "Recovered task");
            }
            Ok(false) => task.add_log(&format!("Recovery from {} failure declined", phase)),
            Err(e) => task.add_log(&format!("Recovery from {} failure failed: {}", phase, e)),
        }
        self.store.save_task(&task).await?;
        Ok(task.status)
    }

    /// Redo a finished task from `phase` as a new run.
    ///
    /// Restarting at setup starts from an empty working directory, unless
    /// the task shares another task's directory. Later phases keep it.
    pub async fn restart_at(&self, id: TaskId, phase: Phase) -> Result<TaskStatus> {
        let mut task = self.store.load_task(id).await?;
        if !task.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: task.status.to_string(),
                to: phase.entry_status().to_string(),
            });
        }
        let descriptor = self.descriptor(&task)?;
        if !descriptor.plugin.supports_restart(phase) {
            return Err(Error::RestartUnsupported {
                operation: task.operation.clone(),
                phase,
            });
        }

        // The stored task and its workdir stay untouched until the plugin
        // accepts the restart.
        let previous_workdir = task.workdir.clone();
        task.run_number += 1;
        task.failure = None;
        if phase != Phase::PostProcessing {
            task.job = None;
        }

        let version = Self::tool_version(&task, &descriptor).ok().flatten();
        let accepted = {
            let mut ctx = HookContext {
                task: &mut task,
                cache: &self.cache,
                ledger: &self.ledger,
                version: version.as_ref(),
                outcome: None,
            };
            descriptor.plugin.restart_at(phase, &mut ctx).await?
        };
        if !accepted {
            return Err(Error::Validation(format!(
                "Operation '{}' declined to restart task {} at {}",
                task.operation,
                task.id.short(),
                phase
            )));
        }

        if phase == Phase::Setup && task.share_workdir_of.is_none() {
            if let Some(dir) = previous_workdir {
                blocking(move || util::remove_path(&dir)).await?;
            }
        }
        self.prepare_workdir(&mut task).await?;

        task.transition(
            phase.entry_status(),
            Some(&format!("restart run {}", task.run_number)),
        )?;
        task.add_log(&format!("Restarted at {} as run {}", phase, task.run_number));
        self.store.save_task(&task).await?;
        tracing::info!(task = %task.id.short(), %phase, run = task.run_number, "Restarted task");
        Ok(task.status)
    }

    /// Cancel a dispatched or executing task. Recorded as an execution failure.
    pub async fn cancel(&self, id: TaskId) -> Result<TaskStatus> {
        let mut task = self.store.load_task(id).await?;
        if !matches!(task.status, TaskStatus::Dispatched | TaskStatus::Executing) {
            return Err(Error::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::FailedExecution.to_string(),
            });
        }
        if let Some(job) = &task.job {
            self.environment.cancel(job).await?;
        }
        task.fail(Phase::Execute, ReasonCode::Cancelled, "cancelled by user", "")?;
        self.store.save_task(&task).await?;
        Ok(task.status)
    }
}

fn failure_reason(outcome: &JobOutcome) -> (ReasonCode, String) {
    match outcome.exit_code {
        Some(0) => (
            ReasonCode::ErrorSignature,
            "job output matched a failure signature".to_string(),
        ),
        Some(code) => (ReasonCode::NonZeroExit, format!("job exited with code {}", code)),
        None => (
            ReasonCode::NonZeroExit,
            "job was killed or lost before reporting an exit code".to_string(),
        ),
    }
}
