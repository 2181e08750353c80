use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use taskline::config::Config;
use taskline::core::{ArtifactId, EnvironmentRef, Phase, RequestId, TaskId, TaskRequest};
use taskline::orchestration::{LocalShell, SchedulerReport};
use taskline::registry::OperationRegistry;
use taskline::version::{CapabilityProbe, CommandProber, StaticProber};
use taskline::{Error, Result, TaskEngine};

/// Taskline - fan-out task lifecycle engine for external tools
#[derive(Parser, Debug)]
#[command(name = "taskline")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    TASKLINE_HOME   Base directory (default ~/.taskline)\n    TASKLINE_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.taskline/taskline.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file to use instead of the default
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Write a default config file if none exists
    Init,

    /// List registered operations
    Ops,

    /// Import a file or directory into the artifact store
    Import {
        path: PathBuf,

        /// Artifact to file the import under
        #[arg(long)]
        parent: Option<String>,
    },

    /// List artifacts in the store
    Artifacts,

    /// Validate and plan a request, optionally running it
    Submit {
        /// Operation id
        operation: String,

        /// Input artifact ids
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Parameter as KEY=VALUE; VALUE is read as JSON when it parses
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,

        #[arg(long)]
        description: Option<String>,

        /// Pin the tool version instead of probing it
        #[arg(long)]
        tool_version: Option<String>,

        /// Run the planned tasks right away
        #[arg(long)]
        run: bool,
    },

    /// Run a request's tasks, or resume every unfinished task
    Run {
        request_id: Option<String>,
    },

    /// Show tasks, optionally for one request
    Status {
        request_id: Option<String>,

        /// Print full records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-attempt the failed phase of a task
    Recover { task_id: String },

    /// Start a finished task again at a phase
    Restart {
        task_id: String,

        /// setup, execute or post_processing
        phase: String,
    },

    /// Cancel a running job
    Cancel { task_id: String },

    /// Show how an artifact was derived
    Provenance { artifact_id: String },

    /// Check a tool's version against a minimum
    VersionCheck { tool: String, minimum: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    taskline::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run_command(cli.command, config));
    if result.is_err() && taskline::log::is_debug() {
        if let Some(path) = taskline::log::log_path() {
            eprintln!("see {} for details", path.display());
        }
    }
    result
}

async fn run_command(command: Command, config: Config) -> Result<()> {
    if command == Command::Init {
        return run_init(&config);
    }
    if let Command::VersionCheck { tool, minimum } = &command {
        return run_version_check(&config, tool, minimum).await;
    }

    let registry = load_registry(&config)?;
    let environment = Arc::new(LocalShell::new()?);
    let engine = TaskEngine::open(config, registry, environment).await?;

    match command {
        Command::Ops => run_ops(&engine),
        Command::Import { path, parent } => {
            let parent = parent.as_deref().map(parse_id::<ArtifactId>).transpose()?;
            let artifact = engine.import(&path, parent).await?;
            println!("{}  {}  ({})", artifact.id, artifact.name, artifact.kind);
            Ok(())
        }
        Command::Artifacts => {
            for artifact in engine.artifacts().await? {
                println!(
                    "{}  v{:<3} {:<12} {}",
                    artifact.id.short(),
                    artifact.version,
                    artifact.kind.to_string(),
                    artifact.name
                );
            }
            Ok(())
        }
        Command::Submit {
            operation,
            inputs,
            params,
            description,
            tool_version,
            run,
        } => {
            let request = build_request(&operation, &inputs, &params, description, tool_version)?;
            run_submit(&engine, request, run).await
        }
        Command::Run { request_id } => {
            let report = match request_id {
                Some(id) => engine.run_request(parse_id::<RequestId>(&id)?).await?,
                None => {
                    let ids = engine.unfinished_tasks().await?;
                    if ids.is_empty() {
                        println!("Nothing to run.");
                        return Ok(());
                    }
                    run_with_shutdown(&engine, &ids).await?
                }
            };
            print_report(&report);
            Ok(())
        }
        Command::Status { request_id, json } => run_status(&engine, request_id, json).await,
        Command::Recover { task_id } => {
            let status = engine.recover(parse_id(&task_id)?).await?;
            println!("Task {} is now {}", task_id, status);
            Ok(())
        }
        Command::Restart { task_id, phase } => {
            let status = engine
                .restart_at(parse_id(&task_id)?, Phase::from_str(&phase)?)
                .await?;
            println!("Task {} is now {}", task_id, status);
            Ok(())
        }
        Command::Cancel { task_id } => {
            let status = engine.cancel(parse_id(&task_id)?).await?;
            println!("Task {} is now {}", task_id, status);
            Ok(())
        }
        Command::Provenance { artifact_id } => {
            let records = engine.provenance_of(parse_id(&artifact_id)?);
            if records.is_empty() {
                println!("No derivations recorded for {}", artifact_id);
            }
            for record in records {
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            Ok(())
        }
        Command::Init | Command::VersionCheck { .. } => Ok(()),
    }
}

fn load_registry(config: &Config) -> Result<OperationRegistry> {
    let mut registry = OperationRegistry::new();
    for path in config.manifest_paths() {
        let count = registry.load_manifest(&path)?;
        tracing::info!(path = %path.display(), count, "Loaded manifest");
    }
    Ok(registry)
}

fn parse_id<T>(raw: &str) -> Result<T>
where
    T: FromStr<Err = uuid::Error>,
{
    raw.parse::<T>()
        .map_err(|e| Error::Validation(format!("Invalid id '{}': {}", raw, e)))
}

/// Split `KEY=VALUE`, reading VALUE as JSON when possible.
fn parse_param(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| Error::Validation(format!("Expected KEY=VALUE, got '{}'", raw)))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn build_request(
    operation: &str,
    inputs: &[String],
    params: &[String],
    description: Option<String>,
    tool_version: Option<String>,
) -> Result<TaskRequest> {
    let inputs = inputs
        .iter()
        .map(|raw| parse_id::<ArtifactId>(raw))
        .collect::<Result<Vec<_>>>()?;
    let mut request = TaskRequest::new(operation, inputs);
    for raw in params {
        let (key, value) = parse_param(raw)?;
        request = request.with_param(&key, value);
    }
    if let Some(description) = description {
        request = request.with_description(&description);
    }
    if tool_version.is_some() {
        request = request.with_environment(EnvironmentRef {
            tool_version,
            ..EnvironmentRef::local()
        });
    }
    Ok(request)
}

fn run_init(config: &Config) -> Result<()> {
    let path = Config::config_path()?;
    if path.exists() {
        println!("{} already exists", path.display());
        return Ok(());
    }
    config.save()?;
    config.ensure_dirs()?;
    println!("wrote {}", path.display());
    Ok(())
}

fn run_ops(engine: &TaskEngine) -> Result<()> {
    let registry = engine.registry();
    if registry.is_empty() {
        println!("No operations registered. Add manifests to the config file.");
        return Ok(());
    }
    for id in registry.ids() {
        let descriptor = registry.get(&id)?;
        println!(
            "{:<24} {:<10} tool={}",
            descriptor.id,
            format!("{:?}", descriptor.mode),
            descriptor.tool.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run_submit(engine: &TaskEngine, request: TaskRequest, run: bool) -> Result<()> {
    let submission = engine.submit(request).await?;
    for notice in &submission.notices {
        println!("note: {}", notice);
    }
    println!(
        "Request {} planned {} task(s)",
        submission.request.id,
        submission.tasks.len()
    );
    for task in &submission.tasks {
        println!("  {}  {}", task.id.short(), task.operation);
    }
    if run {
        let report = run_with_shutdown(engine, &submission.task_ids()).await?;
        print_report(&report);
    }
    Ok(())
}

/// Run tasks, stopping cleanly on Ctrl-C.
async fn run_with_shutdown(engine: &TaskEngine, ids: &[TaskId]) -> Result<SchedulerReport> {
    let scheduler = engine.scheduler();
    let shutdown = scheduler.shutdown_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });
    let report = scheduler.run(ids).await;
    watcher.abort();
    report
}

fn print_report(report: &SchedulerReport) {
    println!(
        "completed: {}  failed: {}  blocked: {}",
        report.completed.len(),
        report.failed.len(),
        report.blocked.len()
    );
    if report.interrupted {
        println!("Interrupted; run again to resume.");
    }
}

async fn run_status(engine: &TaskEngine, request_id: Option<String>, json: bool) -> Result<()> {
    let tasks = match request_id {
        Some(id) => {
            engine
                .store()
                .tasks_for_request(parse_id::<RequestId>(&id)?)
                .await?
        }
        None => engine.store().list_tasks().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for task in tasks {
        println!(
            "{}  {:<24} {:<22} run {}",
            task.id.short(),
            task.operation,
            task.status.to_string(),
            task.run_number
        );
        if let Some(failure) = &task.failure {
            println!("    {:?}: {}", failure.reason, failure.message);
        }
    }
    Ok(())
}

async fn run_version_check(config: &Config, tool: &str, minimum: &str) -> Result<()> {
    let probe = CapabilityProbe::new(StaticProber::new(config.tool_versions.clone()))
        .with_fallback(CommandProber);
    let raw = probe.resolve(tool).await?;
    let version = taskline::version::ToolVersion::parse(&raw)?;
    let ok = version.is_at_least(minimum)?;
    println!(
        "{} {} ({}) {} {}",
        tool,
        version.numeric(),
        raw.trim(),
        if ok { ">=" } else { "<" },
        minimum
    );
    Ok(())
}
