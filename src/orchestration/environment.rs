//! Execution environments: where a task's commands actually run.
//!
//! Job state lives on disk next to the task so a fresh process can poll a
//! job submitted by an earlier one. `LocalShell` runs commands through
//! bash on this machine.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::{ConcreteTask, JobHandle};
use crate::util::shell_quote;
use crate::{Error, Result};

/// Directory inside the working directory holding job scripts and output.
pub const JOB_DIR: &str = ".taskline";

const CANCELLED_MARK: &str = "cancelled";
const WALLTIME_MARK: &str = "walltime";
const SIGNAL_MARK: &str = "signal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobState {
    Queued,
    Running,
    /// `code` is `None` when the process was killed or lost.
    Exited { code: Option<i32> },
    /// Cancelled by the user or killed for exceeding its walltime.
    Cancelled,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Exited { .. } | JobState::Cancelled)
    }
}

/// What a finished job left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub exit_code: Option<i32>,
    pub cancelled: bool,
    pub stdout: String,
    pub stderr: String,
}

impl JobOutcome {
    /// Tail of stderr followed by the tail of stdout.
    pub fn diagnostics(&self, lines: usize) -> String {
        let mut out = String::new();
        let stderr = crate::util::tail_lines(&self.stderr, lines);
        if !stderr.is_empty() {
            out.push_str("--- stderr ---\n");
            out.push_str(&stderr);
        }
        let stdout = crate::util::tail_lines(&self.stdout, lines);
        if !stdout.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("--- stdout ---\n");
            out.push_str(&stdout);
        }
        out
    }
}

/// Boundary to whatever runs the commands.
///
/// `submit` must return as soon as the job is accepted.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(
        &self,
        task: &ConcreteTask,
        commands: &[String],
        walltime: Duration,
    ) -> Result<JobHandle>;

    async fn poll(&self, job: &JobHandle) -> Result<JobState>;

    /// Exit status and captured output of a finished job.
    async fn outcome(&self, job: &JobHandle) -> Result<JobOutcome>;

    async fn cancel(&self, job: &JobHandle) -> Result<()>;
}

/// Runs jobs as local bash processes.
pub struct LocalShell {
    shell: PathBuf,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl LocalShell {
    pub const NAME: &'static str = "local";

    /// Locate bash on `PATH`.
    pub fn new() -> Result<Self> {
        let shell = which::which("bash")
            .map_err(|_| Error::Environment("bash not found on PATH".to_string()))?;
        Ok(Self::with_shell(shell))
    }

    pub fn with_shell(shell: PathBuf) -> Self {
        Self {
            shell,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn file(base: &Path, ext: &str) -> PathBuf {
        base.with_extension(ext)
    }

    async fn read_or_empty(path: PathBuf) -> Result<String> {
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exit_mark(base: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(Self::file(base, "exit")).await {
            Ok(mark) => Ok(Some(mark.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn state_from_mark(mark: &str) -> JobState {
        match mark {
            CANCELLED_MARK | WALLTIME_MARK => JobState::Cancelled,
            other => JobState::Exited {
                code: other.parse().ok(),
            },
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for LocalShell {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn submit(
        &self,
        task: &ConcreteTask,
        commands: &[String],
        walltime: Duration,
    ) -> Result<JobHandle> {
        let workdir = task.workdir.clone().ok_or_else(|| {
            Error::Environment(format!("Task {} has no working directory", task.id.short()))
        })?;
        let job_dir = workdir.join(JOB_DIR);
        tokio::fs::create_dir_all(&job_dir).await?;
        let base = job_dir.join(format!("run-{}", task.run_number));

        // A recovered execution resubmits under the same run number.
        for ext in ["exit", "out", "err"] {
            match tokio::fs::remove_file(Self::file(&base, ext)).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }

        let mut script = String::from("set -e\n");
        script.push_str(&format!("cd {}\n", shell_quote(&workdir.to_string_lossy())));
        for command in commands {
            script.push_str(command);
            script.push('\n');
        }
        let script_path = Self::file(&base, "sh");
        tokio::fs::write(&script_path, script).await?;

        let stdout = tokio::fs::File::create(Self::file(&base, "out"))
            .await?
            .into_std()
            .await;
        let stderr = tokio::fs::File::create(Self::file(&base, "err"))
            .await?
            .into_std()
            .await;

        let mut child = Command::new(&self.shell)
            .arg(&script_path)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Environment(format!("Failed to start job: {}", e)))?;

        let id = base.to_string_lossy().into_owned();
        let cancel = CancellationToken::new();
        self.running().insert(id.clone(), cancel.clone());

        let exit_path = Self::file(&base, "exit");
        let task_id = task.id.short();
        tokio::spawn(async move {
            let mark = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status
                        .code()
                        .map_or_else(|| SIGNAL_MARK.to_string(), |c| c.to_string()),
                    Err(e) => {
                        tracing::warn!(task = %task_id, error = %e, "Waiting on job failed");
                        SIGNAL_MARK.to_string()
                    }
                },
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    CANCELLED_MARK.to_string()
                }
                _ = tokio::time::sleep(walltime) => {
                    tracing::warn!(task = %task_id, ?walltime, "Job exceeded walltime");
                    let _ = child.kill().await;
                    WALLTIME_MARK.to_string()
                }
            };
            if let Err(e) = tokio::fs::write(&exit_path, &mark).await {
                tracing::error!(task = %task_id, error = %e, "Failed to record job exit");
            }
        });

        tracing::info!(
            task = %task.id.short(),
            run = task.run_number,
            commands = commands.len(),
            "Submitted local job"
        );
        Ok(JobHandle {
            id,
            environment: Self::NAME.to_string(),
            submitted_at: Utc::now(),
        })
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobState> {
        let base = PathBuf::from(&job.id);
        if let Some(mark) = Self::exit_mark(&base).await? {
            self.running().remove(&job.id);
            return Ok(Self::state_from_mark(&mark));
        }
        if self.running().contains_key(&job.id) {
            return Ok(JobState::Running);
        }
        // Submitted by a process that has since gone away; the job died with it.
        tracing::warn!(job = %job.id, "Job has no exit record and no live process");
        Ok(JobState::Exited { code: None })
    }

    async fn outcome(&self, job: &JobHandle) -> Result<JobOutcome> {
        let base = PathBuf::from(&job.id);
        let state = self.poll(job).await?;
        let (exit_code, cancelled) = match state {
            JobState::Exited { code } => (code, false),
            JobState::Cancelled => (None, true),
            JobState::Queued | JobState::Running => {
                return Err(Error::Environment(format!(
                    "Job {} has not finished",
                    job.id
                )))
            }
        };
        Ok(JobOutcome {
            exit_code,
            cancelled,
            stdout: Self::read_or_empty(Self::file(&base, "out")).await?,
            stderr: Self::read_or_empty(Self::file(&base, "err")).await?,
        })
    }

    async fn cancel(&self, job: &JobHandle) -> Result<()> {
        let token = self.running().get(&job.id).cloned();
        match token {
            Some(token) => token.cancel(),
            None => {
                let base = PathBuf::from(&job.id);
                if Self::exit_mark(&base).await?.is_none() {
                    tokio::fs::write(Self::file(&base, "exit"), CANCELLED_MARK).await?;
                }
            }
        }
        tracing::info!(job = %job.id, "Cancelled job");
        Ok(())
    }
}
