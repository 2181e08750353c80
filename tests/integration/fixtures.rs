//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - An engine rooted in a temporary directory
//! - A simulated execution environment with scripted job outcomes
//! - Template operations that turn `name.txt` into `name_out.txt`

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use taskline::config::Config;
use taskline::core::{Artifact, ArtifactKind, ConcreteTask, JobHandle, Phase};
use taskline::orchestration::{ExecutionEnvironment, JobOutcome, JobState};
use taskline::plugin::{CommandTemplate, HookContext, TaskPlugin, TemplatePlugin};
use taskline::registry::{FanInSpec, FanOutMode, OperationDescriptor, OperationRegistry, ParamKind, ParamSpec};
use taskline::version::ToolVersion;
use taskline::{Result, TaskEngine};

pub const TOOL: &str = "convert";

/// Scripted effect of a job: may write into the task's workdir.
pub type Behavior = dyn Fn(&ConcreteTask, &[String]) -> JobOutcome + Send + Sync;

/// In-process stand-in for a job runner.
///
/// Each submission runs `behavior` immediately and records the outcome.
/// While held, jobs report Running until released or cancelled.
pub struct SimulatedEnvironment {
    behavior: Box<Behavior>,
    jobs: Mutex<HashMap<String, (JobState, JobOutcome)>>,
    submitted: Mutex<Vec<Vec<String>>>,
    held: AtomicBool,
    next: AtomicUsize,
}

impl SimulatedEnvironment {
    /// Jobs succeed and write `<stem>_out.txt` for every staged input.
    pub fn new() -> Self {
        Self::with_behavior(|task, _| {
            produce_outputs(task);
            JobOutcome {
                exit_code: Some(0),
                stdout: "done\n".to_string(),
                ..Default::default()
            }
        })
    }

    pub fn with_behavior(
        behavior: impl Fn(&ConcreteTask, &[String]) -> JobOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            behavior: Box::new(behavior),
            jobs: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            held: AtomicBool::new(false),
            next: AtomicUsize::new(0),
        }
    }

    /// Jobs submitted from now on stay Running until `release`.
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    /// Command lists of every submission, in order.
    pub fn submissions(&self) -> Vec<Vec<String>> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionEnvironment for SimulatedEnvironment {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn submit(
        &self,
        task: &ConcreteTask,
        commands: &[String],
        _walltime: Duration,
    ) -> Result<JobHandle> {
        self.submitted.lock().unwrap().push(commands.to_vec());
        let outcome = (self.behavior)(task, commands);
        let state = JobState::Exited {
            code: outcome.exit_code,
        };
        let id = format!("sim-{}", self.next.fetch_add(1, Ordering::SeqCst));
        self.jobs
            .lock()
            .unwrap()
            .insert(id.clone(), (state, outcome));
        Ok(JobHandle {
            id,
            environment: self.name().to_string(),
            submitted_at: Utc::now(),
        })
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobState> {
        let jobs = self.jobs.lock().unwrap();
        let state = jobs
            .get(&job.id)
            .map(|(state, _)| *state)
            .unwrap_or(JobState::Exited { code: None });
        if self.held.load(Ordering::SeqCst) && state != JobState::Cancelled {
            return Ok(JobState::Running);
        }
        Ok(state)
    }

    async fn outcome(&self, job: &JobHandle) -> Result<JobOutcome> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(&job.id)
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or_default())
    }

    async fn cancel(&self, job: &JobHandle) -> Result<()> {
        if let Some(entry) = self.jobs.lock().unwrap().get_mut(&job.id) {
            entry.0 = JobState::Cancelled;
            entry.1.cancelled = true;
        }
        Ok(())
    }
}

/// Write `<stem>_out.txt` next to every staged `.txt` input.
pub fn produce_outputs(task: &ConcreteTask) {
    let Some(workdir) = &task.workdir else { return };
    for entry in std::fs::read_dir(workdir).unwrap().flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".txt") || name.ends_with("_out.txt") {
            continue;
        }
        let stem = name.split('.').next().unwrap_or_default().to_string();
        let content = std::fs::read_to_string(entry.path()).unwrap_or_default();
        std::fs::write(workdir.join(format!("{}_out.txt", stem)), content.to_uppercase()).unwrap();
    }
}

/// Template plugin for the `convert` operation.
pub fn convert_plugin() -> TemplatePlugin {
    let command = CommandTemplate::new("convert {input} {output} {flags}")
        .with_output("{stem}_out.txt", ArtifactKind::SingleFile);
    TemplatePlugin::new("convert", command)
        .with_schema(convert_schema())
        .recoverable(&[Phase::Setup, Phase::Execute, Phase::PostProcessing])
        .restartable(&[Phase::Setup, Phase::Execute, Phase::PostProcessing])
}

pub fn convert_schema() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new(
            "quality",
            ParamKind::Integer {
                min: Some(1),
                max: Some(100),
            },
        )
        .with_default(80)
        .with_flag("--quality"),
        ParamSpec::new("sharpen", ParamKind::Bool)
            .with_flag("--sharpen")
            .with_min_version("1.1.10"),
        ParamSpec::new("merge", ParamKind::Bool),
    ]
}

/// The `convert` descriptor around another plugin.
pub fn convert_descriptor_with(plugin: Arc<dyn TaskPlugin>, share_workdir: bool) -> OperationDescriptor {
    let descriptor = OperationDescriptor::new("convert", plugin)
        .with_tool(TOOL)
        .with_fan_in(FanInSpec {
            operation: "bundle".to_string(),
            trigger_param: "merge".to_string(),
            params: Vec::new(),
            share_workdir,
        });
    convert_schema()
        .into_iter()
        .fold(descriptor, OperationDescriptor::with_param)
}

/// Job-less fan-in collecting every prerequisite output into one collection.
pub fn bundle_plugin() -> TemplatePlugin {
    let command = CommandTemplate {
        output: Some("bundle".to_string()),
        output_kind: ArtifactKind::Collection,
        ..Default::default()
    };
    TemplatePlugin::new("bundle", command)
}

pub fn bundle_descriptor_with(plugin: TemplatePlugin) -> OperationDescriptor {
    OperationDescriptor::new("bundle", Arc::new(plugin))
        .with_mode(FanOutMode::Batch)
        .with_input_limits(0, 1000)
}

/// Wraps the `convert` plugin with scripted setup failures and restart answers.
pub struct ScriptedPlugin {
    inner: TemplatePlugin,
    setup_failures: AtomicUsize,
    accept_restart: bool,
}

impl ScriptedPlugin {
    pub fn new() -> Self {
        Self {
            inner: convert_plugin(),
            setup_failures: AtomicUsize::new(0),
            accept_restart: true,
        }
    }

    /// The first `count` setups report failure.
    pub fn failing_setup(self, count: usize) -> Self {
        self.setup_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn declining_restart(mut self) -> Self {
        self.accept_restart = false;
        self
    }
}

#[async_trait]
impl TaskPlugin for ScriptedPlugin {
    async fn setup(&self, ctx: &mut HookContext<'_>) -> Result<bool> {
        let remaining = self.setup_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.setup_failures.store(remaining - 1, Ordering::SeqCst);
            ctx.task.add_log("scripted setup failure");
            return Ok(false);
        }
        self.inner.setup(ctx).await
    }

    fn build_commands(&self, task: &ConcreteTask, version: Option<&ToolVersion>) -> Result<Vec<String>> {
        self.inner.build_commands(task, version)
    }

    async fn save_results(&self, ctx: &mut HookContext<'_>) -> Result<bool> {
        self.inner.save_results(ctx).await
    }

    fn supports_recovery(&self, phase: Phase) -> bool {
        self.inner.supports_recovery(phase)
    }

    async fn recover_from_failure(&self, phase: Phase, ctx: &mut HookContext<'_>) -> Result<bool> {
        self.inner.recover_from_failure(phase, ctx).await
    }

    fn supports_restart(&self, phase: Phase) -> bool {
        self.inner.supports_restart(phase)
    }

    async fn restart_at(&self, _phase: Phase, _ctx: &mut HookContext<'_>) -> Result<bool> {
        Ok(self.accept_restart)
    }
}

pub fn registry() -> OperationRegistry {
    registry_with(Arc::new(convert_plugin()), false, bundle_plugin())
}

/// Registry around the given `convert` and `bundle` plugins.
pub fn registry_with(
    convert: Arc<dyn TaskPlugin>,
    share_workdir: bool,
    bundle: TemplatePlugin,
) -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    registry.register(convert_descriptor_with(convert, share_workdir));
    registry.register(bundle_descriptor_with(bundle));
    registry
}

/// An engine whose directories all live in one temp dir.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub engine: TaskEngine,
}

impl TestEnv {
    pub async fn new(environment: Arc<dyn ExecutionEnvironment>) -> Self {
        Self::with_tool_version(environment, "convert version 1.1.12").await
    }

    pub async fn with_tool_version(environment: Arc<dyn ExecutionEnvironment>, version: &str) -> Self {
        Self::with_registry(environment, version, registry()).await
    }

    pub async fn with_registry(
        environment: Arc<dyn ExecutionEnvironment>,
        version: &str,
        registry: OperationRegistry,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = test_config(temp_dir.path(), version);
        let engine = TaskEngine::open(config, registry, environment)
            .await
            .expect("Failed to open engine");
        Self { temp_dir, engine }
    }

    /// Reopen the engine over the same directories, as a new process would.
    pub async fn reopen(&self, environment: Arc<dyn ExecutionEnvironment>) -> TaskEngine {
        TaskEngine::open(self.engine.config().clone(), registry(), environment)
            .await
            .expect("Failed to reopen engine")
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Write `name` with `content` and import it.
    pub async fn import_file(&self, name: &str, content: &str) -> Artifact {
        let dir = self.path().join("incoming");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        self.engine.import(&path, None).await.expect("Failed to import")
    }

    /// Read the durable content of a single-file artifact.
    pub async fn read_artifact(&self, artifact: &Artifact) -> String {
        let path = self.engine.cache().ensure_local(artifact.id).await.unwrap();
        std::fs::read_to_string(path).unwrap()
    }

    pub fn workdir_of(&self, task: &ConcreteTask) -> PathBuf {
        task.workdir.clone().expect("task has no workdir")
    }
}

pub fn test_config(root: &Path, version: &str) -> Config {
    let dir = |name: &str| Some(root.join(name).to_string_lossy().into_owned());
    let mut tool_versions = BTreeMap::new();
    tool_versions.insert(TOOL.to_string(), version.to_string());
    Config {
        store_dir: dir("store"),
        cache_dir: dir("cache"),
        work_dir: dir("work"),
        state_dir: dir("state"),
        max_concurrent: Some(4),
        poll_interval_ms: Some(5),
        tool_versions,
        ..Default::default()
    }
}
