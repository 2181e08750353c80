//! Framework-to-tool plugin contract.
//!
//! Every operation supplies a `TaskPlugin`. Validation hooks run at
//! submission; lifecycle hooks run inside the execution state machine and
//! receive a `HookContext` giving them the task, the sync cache and the
//! provenance ledger.

pub mod template;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{DestageTarget, FileSyncCache};
use crate::core::{
    framework_keys, Artifact, ArtifactId, ArtifactKind, ConcreteTask, Phase, TaskRequest,
};
use crate::orchestration::environment::JobOutcome;
use crate::provenance::{DerivationRecord, ProvenanceLedger};
use crate::validation::FieldErrors;
use crate::version::ToolVersion;
use crate::{Error, Result};

pub use template::{CommandTemplate, TemplatePlugin};

/// Framework key listing outputs of a task's prerequisites.
pub const PREREQUISITE_OUTPUTS: &str = "prerequisite_outputs";

const DEFAULT_WALLTIME: Duration = Duration::from_secs(60 * 60);

/// What a pre-dispatch hook can see and adjust.
pub struct PreDispatchContext<'a> {
    pub request: &'a TaskRequest,
    /// Inputs that passed the applicability checks, in selection order.
    pub inputs: &'a [Artifact],
    pub params: &'a mut BTreeMap<String, Value>,
    pub version: Option<&'a ToolVersion>,
}

/// What a lifecycle hook works with.
pub struct HookContext<'a> {
    pub task: &'a mut ConcreteTask,
    pub cache: &'a FileSyncCache,
    pub ledger: &'a ProvenanceLedger,
    pub version: Option<&'a ToolVersion>,
    /// Outcome of the finished job, during post-processing.
    pub outcome: Option<&'a JobOutcome>,
}

impl<'a> HookContext<'a> {
    pub fn workdir(&self) -> Result<&Path> {
        self.task.workdir.as_deref().ok_or_else(|| {
            Error::Validation(format!("Task {} has no working directory", self.task.id.short()))
        })
    }

    pub async fn describe(&self, id: ArtifactId) -> Result<Artifact> {
        self.cache.store().describe(id).await
    }

    /// Stage one artifact into the working directory under `target_name`.
    pub async fn stage_input(&mut self, artifact: ArtifactId, target_name: &str) -> Result<PathBuf> {
        let path = self
            .cache
            .stage_local_copy(self.task, artifact, target_name)
            .await?;
        self.task
            .add_log(&format!("Staged {} as {}", artifact.short(), target_name));
        Ok(path)
    }

    /// Artifacts a task works on: its inputs, resolved companions, and
    /// outputs of its prerequisites.
    pub fn staged_artifact_ids(&self) -> Vec<ArtifactId> {
        let mut ids = self.task.inputs.clone();
        if let Some(companions) = self
            .task
            .params
            .framework
            .get(framework_keys::COMPANIONS)
            .and_then(Value::as_object)
        {
            ids.extend(
                companions
                    .values()
                    .filter_map(Value::as_str)
                    .filter_map(|s| s.parse::<ArtifactId>().ok()),
            );
        }
        if let Some(outputs) = self
            .task
            .params
            .framework
            .get(PREREQUISITE_OUTPUTS)
            .and_then(Value::as_array)
        {
            ids.extend(
                outputs
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| s.parse::<ArtifactId>().ok()),
            );
        }
        let mut seen = std::collections::HashSet::new();
        ids.retain(|id| seen.insert(*id));
        ids
    }

    /// Stage every artifact the task works on under its own name.
    ///
    /// Transfers run concurrently; each artifact still goes through its
    /// own sync lock.
    pub async fn stage_all(&mut self) -> Result<Vec<(Artifact, PathBuf)>> {
        let ids = self.staged_artifact_ids();
        let cache = self.cache;
        let task: &ConcreteTask = self.task;
        let staged = try_join_all(ids.into_iter().map(|id| async move {
            let artifact = cache.store().describe(id).await?;
            let path = cache.stage_local_copy(task, id, &artifact.name).await?;
            Ok::<_, Error>((artifact, path))
        }))
        .await?;
        for (artifact, _) in &staged {
            self.task.add_log(&format!("Staged {}", artifact.name));
        }
        Ok(staged)
    }

    /// Publish a file or tree from the working directory and record it as
    /// one of this task's outputs.
    pub async fn destage_output(
        &mut self,
        relative: &str,
        target: DestageTarget,
    ) -> Result<Artifact> {
        let local = self.workdir()?.join(relative);
        if tokio::fs::symlink_metadata(&local).await.is_err() {
            return Err(Error::MissingOutput(relative.to_string()));
        }
        let artifact = self.cache.destage(self.task, &local, target).await?;
        self.task.params.push_output_id(artifact.id);
        self.task
            .add_log(&format!("Saved {} ({})", artifact.name, artifact.id.short()));
        Ok(artifact)
    }

    /// Where the task's primary output should be published.
    ///
    /// A re-run updates the artifact an earlier run created. A first run
    /// publishes under the id reserved at setup; if an interrupted attempt
    /// already created that artifact, it is updated instead of duplicated.
    pub async fn output_target(
        &mut self,
        name: &str,
        kind: ArtifactKind,
        parent: Option<ArtifactId>,
    ) -> Result<DestageTarget> {
        if let Some(existing) = self.task.params.output_ids().first() {
            return Ok(DestageTarget::Existing(*existing));
        }
        let id = self.task.params.reserve_output_id();
        if self.cache.store().describe(id).await.is_ok() {
            self.task
                .add_log(&format!("Output {} already published, updating it", id.short()));
            return Ok(DestageTarget::Existing(id));
        }
        let target = DestageTarget::new_artifact(name, kind).with_id(id);
        Ok(match parent {
            Some(p) => target.with_parent(p),
            None => target,
        })
    }

    /// File `child` under `parent` in the ledger and the durable store.
    pub async fn attach_output(&mut self, child: ArtifactId, parent: ArtifactId) -> Result<()> {
        self.ledger.attach(child, parent)?;
        self.cache.set_parent(child, Some(parent)).await?;
        Ok(())
    }

    pub fn record_derivation(
        &mut self,
        inputs: &[ArtifactId],
        outputs: &[ArtifactId],
        note: Option<&str>,
    ) -> Result<DerivationRecord> {
        self.ledger.record(self.task, inputs, outputs, note)
    }
}

/// Hooks an operation supplies to the framework.
///
/// Only `setup`, `build_commands` and `save_results` are mandatory.
/// Recovery and restart are disabled per phase unless the plugin opts in.
#[async_trait]
pub trait TaskPlugin: Send + Sync {
    /// Extra check on an input beyond the descriptor's declared predicate.
    fn applicability_predicate(&self, _artifact: &Artifact) -> bool {
        true
    }

    fn default_parameters(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    /// Returns a notice for the user, or a hard validation error.
    fn pre_dispatch_hook(&self, _ctx: &mut PreDispatchContext<'_>) -> Result<Option<String>> {
        Ok(None)
    }

    /// Cross-field checks; add every violation to `errors`.
    fn post_submission_hook(
        &self,
        _params: &mut BTreeMap<String, Value>,
        _errors: &mut FieldErrors,
        _version: Option<&ToolVersion>,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    async fn setup(&self, ctx: &mut HookContext<'_>) -> Result<bool>;

    /// Shell commands to run. An empty list means the operation submits no job.
    fn build_commands(
        &self,
        task: &ConcreteTask,
        version: Option<&ToolVersion>,
    ) -> Result<Vec<String>>;

    async fn save_results(&self, ctx: &mut HookContext<'_>) -> Result<bool>;

    fn estimate_walltime(&self, _task: &ConcreteTask) -> Duration {
        DEFAULT_WALLTIME
    }

    /// Whether a finished job succeeded.
    fn success_predicate(&self, outcome: &JobOutcome) -> bool {
        outcome.exit_code == Some(0) && !outcome.cancelled
    }

    fn supports_recovery(&self, _phase: Phase) -> bool {
        false
    }

    /// Idempotent cleanup before re-entering `phase` with the same run number.
    async fn recover_from_failure(&self, _phase: Phase, _ctx: &mut HookContext<'_>) -> Result<bool> {
        Ok(true)
    }

    fn supports_restart(&self, _phase: Phase) -> bool {
        false
    }

    /// Preparation before re-entering `phase` with a new run number.
    async fn restart_at(&self, _phase: Phase, _ctx: &mut HookContext<'_>) -> Result<bool> {
        Ok(true)
    }
}
