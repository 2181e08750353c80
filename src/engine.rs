//! Entry point tying the lifecycle components together.
//!
//! `TaskEngine` validates and plans submissions, persists them, and hands
//! tasks to the scheduler and state machine. Recovery, restart and
//! cancellation go through here too.

use std::path::Path;
use std::sync::Arc;

use crate::cache::{DirStore, FileSyncCache, LinkMode};
use crate::config::Config;
use crate::core::{Artifact, ArtifactId, ConcreteTask, Phase, RequestId, TaskDAG, TaskId, TaskRequest, TaskStatus};
use crate::orchestration::environment::ExecutionEnvironment;
use crate::orchestration::machine::ExecutionStateMachine;
use crate::orchestration::planner::FanOutPlanner;
use crate::orchestration::scheduler::{Scheduler, SchedulerReport};
use crate::provenance::{DerivationRecord, ProvenanceLedger};
use crate::registry::{OperationDescriptor, OperationRegistry};
use crate::state::StateStore;
use crate::validation::ParameterPipeline;
use crate::version::{CapabilityProbe, CommandProber, StaticProber, ToolVersion};
use crate::Result;

/// Name of the directory-backed store results are published to.
pub const LOCAL_STORE_ID: &str = "local";

/// A planned and persisted request.
#[derive(Debug, Clone)]
pub struct Submission {
    pub request: TaskRequest,
    pub tasks: Vec<ConcreteTask>,
    /// Non-fatal validation messages for the user.
    pub notices: Vec<String>,
}

impl Submission {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id).collect()
    }
}

pub struct TaskEngine {
    config: Config,
    registry: Arc<OperationRegistry>,
    artifacts: Arc<DirStore>,
    cache: Arc<FileSyncCache>,
    ledger: Arc<ProvenanceLedger>,
    store: Arc<StateStore>,
    probe: Arc<CapabilityProbe>,
    machine: Arc<ExecutionStateMachine>,
}

impl TaskEngine {
    /// Open every store under the configured directories.
    ///
    /// Tool versions come from `config.tool_versions` first and from running
    /// the tool otherwise.
    pub async fn open(
        config: Config,
        registry: OperationRegistry,
        environment: Arc<dyn ExecutionEnvironment>,
    ) -> Result<Self> {
        let probe = CapabilityProbe::new(StaticProber::new(config.tool_versions.clone()))
            .with_fallback(CommandProber);
        Self::open_with_probe(config, registry, environment, probe).await
    }

    pub async fn open_with_probe(
        config: Config,
        registry: OperationRegistry,
        environment: Arc<dyn ExecutionEnvironment>,
        probe: CapabilityProbe,
    ) -> Result<Self> {
        config.ensure_dirs()?;
        registry.validate()?;

        let artifacts = Arc::new(DirStore::open(LOCAL_STORE_ID, &config.store_dir()?).await?);
        let link_mode = if config.copy_inputs {
            LinkMode::Copy
        } else {
            LinkMode::Symlink
        };
        let cache = Arc::new(FileSyncCache::open(&config.cache_dir()?, artifacts.clone(), link_mode).await?);
        let store = Arc::new(StateStore::open(&config.state_dir()?).await?);
        let ledger = Arc::new(store.load_ledger().await?);
        let registry = Arc::new(registry);

        let machine = Arc::new(ExecutionStateMachine::new(
            registry.clone(),
            cache.clone(),
            ledger.clone(),
            environment,
            store.clone(),
            config.work_dir()?,
        ));

        tracing::info!(
            operations = registry.len(),
            derivations = ledger.len(),
            "Task engine ready"
        );

        Ok(Self {
            config,
            registry,
            artifacts,
            cache,
            ledger,
            store,
            probe: Arc::new(probe),
            machine,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<FileSyncCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<ProvenanceLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn machine(&self) -> &Arc<ExecutionStateMachine> {
        &self.machine
    }

    /// Bring a local file or directory into the artifact store.
    pub async fn import(&self, path: &Path, parent: Option<ArtifactId>) -> Result<Artifact> {
        let artifact = self.artifacts.import(path, parent).await?;
        if let Some(parent) = parent {
            self.ledger.attach(artifact.id, parent)?;
            self.store.save_ledger(&self.ledger).await?;
        }
        Ok(artifact)
    }

    pub async fn artifacts(&self) -> Result<Vec<Artifact>> {
        use crate::cache::ArtifactStore;
        self.artifacts.list().await
    }

    /// Version a request's tasks run against.
    ///
    /// The request's environment may pin one; otherwise the tool is probed.
    /// `None` when the operation has no tool or no usable version exists.
    pub async fn resolve_version(
        &self,
        descriptor: &OperationDescriptor,
        pinned: Option<&str>,
    ) -> Option<ToolVersion> {
        let tool = descriptor.tool.as_deref()?;
        let raw = match pinned {
            Some(raw) => raw.to_string(),
            None => match self.probe.resolve(tool).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(tool, error = %e, "Could not determine tool version");
                    return None;
                }
            },
        };
        match ToolVersion::parse(&raw) {
            Ok(version) => Some(version),
            Err(e) => {
                tracing::warn!(tool, raw = %raw, error = %e, "Unusable tool version");
                None
            }
        }
    }

    /// Validate, plan and persist a request.
    ///
    /// Nothing is written when validation or planning fails.
    pub async fn submit(&self, mut request: TaskRequest) -> Result<Submission> {
        use crate::cache::ArtifactStore;

        let descriptor = self.registry.get(&request.operation)?;
        let mut candidates = Vec::with_capacity(request.inputs.len());
        for id in &request.inputs {
            candidates.push(self.artifacts.describe(*id).await?);
        }
        let catalog = if descriptor.companions.is_empty() {
            Vec::new()
        } else {
            self.artifacts.list().await?
        };

        let version = self
            .resolve_version(&descriptor, request.environment.tool_version.as_deref())
            .await;
        let params = ParameterPipeline::new(&descriptor, version)
            .validate(&request, &candidates, &catalog)?;

        request.params = params.params.clone();
        if request.results_store_id.is_none() {
            request.results_store_id = Some(self.artifacts.id().to_string());
        }

        let mut tasks = FanOutPlanner::new(&self.registry).plan(&mut request, &params)?;
        // Fan-in tasks run a different tool than the request's operation.
        for task in tasks.iter_mut().filter(|t| t.operation != request.operation) {
            let fan_in = self.registry.get(&task.operation)?;
            task.tool_version = self
                .resolve_version(&fan_in, None)
                .await
                .map(|v| v.raw().to_string());
        }
        TaskDAG::from_tasks(&tasks)?;

        self.store.save_request(&request).await?;
        for task in &tasks {
            self.store.save_task(task).await?;
        }

        tracing::info!(
            request = %request.id.short(),
            operation = %request.operation,
            tasks = tasks.len(),
            notices = params.notices.len(),
            "Submitted request"
        );
        Ok(Submission {
            request,
            tasks,
            notices: params.notices,
        })
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.machine.clone(),
            self.config.effective_max_concurrent(),
            self.config.poll_interval(),
        )
    }

    /// Drive `ids` until each is finished or blocked.
    pub async fn run(&self, ids: &[TaskId]) -> Result<SchedulerReport> {
        self.scheduler().run(ids).await
    }

    pub async fn run_request(&self, request: RequestId) -> Result<SchedulerReport> {
        self.store.load_request(request).await?;
        let ids: Vec<TaskId> = self
            .store
            .tasks_for_request(request)
            .await?
            .iter()
            .map(|t| t.id)
            .collect();
        self.run(&ids).await
    }

    /// Tasks a previous process left unfinished.
    pub async fn unfinished_tasks(&self) -> Result<Vec<TaskId>> {
        Ok(self
            .store
            .list_tasks()
            .await?
            .into_iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id)
            .collect())
    }

    pub async fn task(&self, id: TaskId) -> Result<ConcreteTask> {
        self.store.load_task(id).await
    }

    pub async fn recover(&self, id: TaskId) -> Result<TaskStatus> {
        self.machine.recover(id).await
    }

    pub async fn restart_at(&self, id: TaskId, phase: Phase) -> Result<TaskStatus> {
        self.machine.restart_at(id, phase).await
    }

    pub async fn cancel(&self, id: TaskId) -> Result<TaskStatus> {
        self.machine.cancel(id).await
    }

    /// How `artifact` came to be, one record per producing run.
    pub fn provenance_of(&self, artifact: ArtifactId) -> Vec<DerivationRecord> {
        self.ledger.derivations_of(artifact)
    }
}
