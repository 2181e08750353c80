//! Concrete task data model.
//!
//! A `ConcreteTask` is one schedulable unit produced by fan-out. It carries
//! its lifecycle status, the attempt counter (`run_number`), namespaced
//! parameters and everything the state machine needs to resume from disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::core::artifact::ArtifactId;
use crate::core::define_id;
use crate::core::request::RequestId;
use crate::{Error, Result};

/// Schema version written into every persisted task record.
pub const CURRENT_TASK_SCHEMA: u32 = 3;

define_id!(
    /// Unique identifier for a concrete task.
    TaskId
);

/// Reserved keys in the framework parameter namespace.
pub mod framework_keys {
    /// Artifacts produced by the task, as a list of ids.
    pub const OUTPUT_IDS: &str = "output_ids";
    /// User-chosen name for the primary output.
    pub const FINAL_OUTPUT_NAME: &str = "final_output_name";
    /// Companion artifacts resolved by naming convention, token -> id.
    pub const COMPANIONS: &str = "companions";
    /// Options dropped because the tool version is too old.
    pub const DROPPED_OPTIONS: &str = "dropped_options";
    /// Id set aside at setup for the first output, so a replayed
    /// post-processing publishes to the same artifact.
    pub const RESERVED_OUTPUT_ID: &str = "reserved_output_id";
}

/// One of the three execution phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Execute,
    PostProcessing,
}

impl Phase {
    /// Status a task enters when (re)starting this phase.
    pub fn entry_status(self) -> TaskStatus {
        match self {
            Phase::Setup => TaskStatus::Setup,
            Phase::Execute => TaskStatus::Dispatched,
            Phase::PostProcessing => TaskStatus::PostProcessing,
        }
    }

    /// Terminal status recorded when this phase fails.
    pub fn failed_status(self) -> TaskStatus {
        match self {
            Phase::Setup => TaskStatus::FailedSetup,
            Phase::Execute => TaskStatus::FailedExecution,
            Phase::PostProcessing => TaskStatus::FailedPostProcessing,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::Execute => write!(f, "execute"),
            Phase::PostProcessing => write!(f, "post_processing"),
        }
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "setup" => Ok(Phase::Setup),
            "execute" | "execution" | "cluster" => Ok(Phase::Execute),
            "post_processing" | "postprocessing" | "post" => Ok(Phase::PostProcessing),
            other => Err(Error::Validation(format!("Unknown phase: {}", other))),
        }
    }
}

/// Lifecycle status of a concrete task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Planned; waiting for prerequisites.
    #[default]
    New,
    /// Staging inputs and preparing the working directory.
    Setup,
    /// Commands handed to the execution environment.
    Dispatched,
    /// The environment reports the job running.
    Executing,
    /// Destaging outputs and recording provenance.
    PostProcessing,
    Completed,
    FailedSetup,
    FailedExecution,
    FailedPostProcessing,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::FailedSetup
                | TaskStatus::FailedExecution
                | TaskStatus::FailedPostProcessing
        )
    }

    pub fn is_failed(self) -> bool {
        self.failed_phase().is_some()
    }

    /// Phase whose failure this status records, if any.
    pub fn failed_phase(self) -> Option<Phase> {
        match self {
            TaskStatus::FailedSetup => Some(Phase::Setup),
            TaskStatus::FailedExecution => Some(Phase::Execute),
            TaskStatus::FailedPostProcessing => Some(Phase::PostProcessing),
            _ => None,
        }
    }

    /// Phase this status belongs to while the task is active.
    pub fn active_phase(self) -> Option<Phase> {
        match self {
            TaskStatus::Setup => Some(Phase::Setup),
            TaskStatus::Dispatched | TaskStatus::Executing => Some(Phase::Execute),
            TaskStatus::PostProcessing => Some(Phase::PostProcessing),
            _ => None,
        }
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// Terminal states may only move back to a phase entry status, which is
    /// how recovery and restart re-enter the lifecycle.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (New, Setup) => true,
            (Setup, Dispatched | FailedSetup) => true,
            // Operations without commands skip straight to post-processing.
            (Dispatched, Executing | PostProcessing | FailedExecution) => true,
            (Executing, PostProcessing | FailedExecution) => true,
            (PostProcessing, Completed | FailedPostProcessing) => true,
            (from, Setup | Dispatched | PostProcessing) if from.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::New => "new",
            TaskStatus::Setup => "setup",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Executing => "executing",
            TaskStatus::PostProcessing => "post_processing",
            TaskStatus::Completed => "completed",
            TaskStatus::FailedSetup => "failed_setup",
            TaskStatus::FailedExecution => "failed_execution",
            TaskStatus::FailedPostProcessing => "failed_post_processing",
        };
        write!(f, "{}", s)
    }
}

/// Structured cause of a phase failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// A plugin hook reported failure.
    HookReturnedFalse,
    /// A plugin hook returned an error.
    HookError,
    NonZeroExit,
    /// The plugin's success predicate rejected the job output.
    ErrorSignature,
    Cancelled,
    SubmissionFailed,
    /// Post-processing produced no derivation record.
    MissingProvenance,
    MalformedVersion,
    MissingOutput,
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReasonCode::HookReturnedFalse => "hook_returned_false",
            ReasonCode::HookError => "hook_error",
            ReasonCode::NonZeroExit => "non_zero_exit",
            ReasonCode::ErrorSignature => "error_signature",
            ReasonCode::Cancelled => "cancelled",
            ReasonCode::SubmissionFailed => "submission_failed",
            ReasonCode::MissingProvenance => "missing_provenance",
            ReasonCode::MalformedVersion => "malformed_version",
            ReasonCode::MissingOutput => "missing_output",
        };
        write!(f, "{}", s)
    }
}

/// What went wrong in the last failed phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub phase: Phase,
    pub reason: ReasonCode,
    pub message: String,
    /// Tail of the captured diagnostic output.
    #[serde(default)]
    pub diagnostics: String,
    pub run_number: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub run_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// Handle to a job submitted to an execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub environment: String,
    pub submitted_at: DateTime<Utc>,
}

/// Task parameters split into tool-specific and framework bookkeeping keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    #[serde(default)]
    pub tool: BTreeMap<String, Value>,
    #[serde(default)]
    pub framework: BTreeMap<String, Value>,
}

impl TaskParams {
    pub fn new(tool: BTreeMap<String, Value>) -> Self {
        Self {
            tool,
            framework: BTreeMap::new(),
        }
    }

    pub fn framework_str(&self, key: &str) -> Option<&str> {
        self.framework.get(key).and_then(Value::as_str)
    }

    /// Output artifact ids recorded in the framework namespace.
    pub fn output_ids(&self) -> Vec<ArtifactId> {
        self.framework
            .get(framework_keys::OUTPUT_IDS)
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn reserved_output_id(&self) -> Option<ArtifactId> {
        self.framework_str(framework_keys::RESERVED_OUTPUT_ID)
            .and_then(|s| s.parse().ok())
    }

    /// The reserved output id, allocating one on first use.
    pub fn reserve_output_id(&mut self) -> ArtifactId {
        if let Some(id) = self.reserved_output_id() {
            return id;
        }
        let id = ArtifactId::new();
        self.framework.insert(
            framework_keys::RESERVED_OUTPUT_ID.to_string(),
            Value::String(id.to_string()),
        );
        id
    }

    pub fn push_output_id(&mut self, id: ArtifactId) {
        let entry = self
            .framework
            .entry(framework_keys::OUTPUT_IDS.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(ids) = entry {
            let id = Value::String(id.to_string());
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }

    /// Companion artifact resolved for `token`, if any.
    pub fn companion(&self, token: &str) -> Option<ArtifactId> {
        self.framework
            .get(framework_keys::COMPANIONS)?
            .get(token)?
            .as_str()?
            .parse()
            .ok()
    }
}

/// One schedulable unit of execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcreteTask {
    pub id: TaskId,
    pub request_id: RequestId,
    pub operation: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Attempt counter. Starts at 1; only restart increments it.
    pub run_number: u32,
    #[serde(default)]
    pub inputs: Vec<ArtifactId>,
    #[serde(default)]
    pub params: TaskParams,
    #[serde(default)]
    pub results_store_id: Option<String>,
    /// Reuse this task's working directory instead of creating one.
    #[serde(default)]
    pub share_workdir_of: Option<TaskId>,
    /// Tasks that must be Completed before this one leaves New.
    #[serde(default)]
    pub prerequisites: Vec<TaskId>,
    #[serde(default)]
    pub tool_version: Option<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub job: Option<JobHandle>,
    #[serde(default)]
    pub failure: Option<FailureReport>,
    #[serde(default)]
    pub history: Vec<StatusHistoryEntry>,
    #[serde(default)]
    pub log: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub schema_version: u32,
}

impl ConcreteTask {
    pub fn new(request_id: RequestId, operation: &str, inputs: Vec<ArtifactId>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            request_id,
            operation: operation.to_string(),
            description: String::new(),
            status: TaskStatus::New,
            run_number: 1,
            inputs,
            params: TaskParams::default(),
            results_store_id: None,
            share_workdir_of: None,
            prerequisites: Vec::new(),
            tool_version: None,
            workdir: None,
            job: None,
            failure: None,
            history: Vec::new(),
            log: Vec::new(),
            created_at: now,
            updated_at: now,
            schema_version: CURRENT_TASK_SCHEMA,
        }
    }

    /// Move to `to`, validating the transition and recording it in history.
    pub fn transition(&mut self, to: TaskStatus, note: Option<&str>) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        self.history.push(StatusHistoryEntry {
            from: self.status,
            to,
            run_number: self.run_number,
            note: note.map(str::to_string),
            at: now,
        });
        tracing::debug!(
            task = %self.id.short(),
            from = %self.status,
            to = %to,
            run = self.run_number,
            "Task transition"
        );
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Record a phase failure and move to the matching Failed* status.
    pub fn fail(
        &mut self,
        phase: Phase,
        reason: ReasonCode,
        message: impl Into<String>,
        diagnostics: impl Into<String>,
    ) -> Result<()> {
        let message = message.into();
        self.transition(phase.failed_status(), Some(&format!("{}: {}", reason, message)))?;
        self.add_log(&format!("{} failed ({}): {}", phase, reason, message));
        self.failure = Some(FailureReport {
            phase,
            reason,
            message,
            diagnostics: diagnostics.into(),
            run_number: self.run_number,
            at: self.updated_at,
        });
        Ok(())
    }

    /// Append a timestamped line to the task log.
    pub fn add_log(&mut self, message: &str) {
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        self.log.push(format!("[{}] {}", stamp, message));
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Tail of the task log, used as setup diagnostics.
    pub fn log_tail(&self, lines: usize) -> String {
        let start = self.log.len().saturating_sub(lines);
        self.log[start..].join("\n")
    }
}
