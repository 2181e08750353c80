//! Manifest-driven plugin that builds commands from a template.
//!
//! Placeholders in the command and output templates:
//!
//! | placeholder         | expands to                                        |
//! |---------------------|---------------------------------------------------|
//! | `{input}`           | staged name of the first input                    |
//! | `{inputs}`          | staged names of all inputs                        |
//! | `{output}`          | rendered output name                              |
//! | `{stem}`            | first input name up to its first `.`              |
//! | `{companion.KEY}`   | staged name of a resolved companion artifact      |
//! | `{flags}`           | schema flags for set options the tool supports    |
//! | `{run}` / `{task}`  | run number / short task id                        |
//! | `{NAME}`            | value of tool parameter `NAME`                    |

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;
use walkdir::WalkDir;

use crate::core::{framework_keys, ArtifactKind, ConcreteTask, Phase};
use crate::orchestration::environment::JobOutcome;
use crate::plugin::{HookContext, TaskPlugin, DEFAULT_WALLTIME};
use crate::registry::ParamSpec;
use crate::util::{self, blocking, shell_quote};
use crate::version::ToolVersion;
use crate::{Error, Result};

/// Framework key mapping staged artifact ids to their names in the workdir.
pub const STAGED_NAMES: &str = "staged_names";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][\w.]*)\}").unwrap());

#[derive(Debug, Clone)]
pub struct CommandTemplate {
    /// Command lines, one per line. `None` submits no job.
    pub template: Option<String>,
    /// Output name template. `None` produces no output.
    pub output: Option<String>,
    pub output_kind: ArtifactKind,
    /// When set, the job output must match for the job to count as successful.
    pub success_pattern: Option<Regex>,
    /// When set, a match in stdout or stderr fails the job.
    pub error_pattern: Option<Regex>,
    pub marker_pattern: Option<Regex>,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self {
            template: None,
            output: None,
            output_kind: ArtifactKind::SingleFile,
            success_pattern: None,
            error_pattern: None,
            marker_pattern: None,
        }
    }
}

impl CommandTemplate {
    pub fn new(template: &str) -> Self {
        Self {
            template: Some(template.to_string()),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: &str, kind: ArtifactKind) -> Self {
        self.output = Some(output.to_string());
        self.output_kind = kind;
        self
    }
}

pub struct TemplatePlugin {
    operation: String,
    schema: Vec<ParamSpec>,
    defaults: BTreeMap<String, Value>,
    command: CommandTemplate,
    walltime: Duration,
    recoverable: Vec<Phase>,
    restartable: Vec<Phase>,
}

impl TemplatePlugin {
    pub fn new(operation: &str, command: CommandTemplate) -> Self {
        Self {
            operation: operation.to_string(),
            schema: Vec::new(),
            defaults: BTreeMap::new(),
            command,
            walltime: DEFAULT_WALLTIME,
            recoverable: Vec::new(),
            restartable: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: Vec<ParamSpec>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_defaults(mut self, defaults: BTreeMap<String, Value>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_walltime(mut self, walltime: Duration) -> Self {
        self.walltime = walltime;
        self
    }

    pub fn recoverable(mut self, phases: &[Phase]) -> Self {
        self.recoverable = phases.to_vec();
        self
    }

    pub fn restartable(mut self, phases: &[Phase]) -> Self {
        self.restartable = phases.to_vec();
        self
    }

    fn staged_name(task: &ConcreteTask, id: &str) -> Option<String> {
        task.params
            .framework
            .get(STAGED_NAMES)?
            .get(id)?
            .as_str()
            .map(str::to_string)
    }

    fn input_names(task: &ConcreteTask) -> Result<Vec<String>> {
        task.inputs
            .iter()
            .map(|id| {
                Self::staged_name(task, &id.to_string()).ok_or_else(|| {
                    Error::Validation(format!(
                        "Input {} of task {} was not staged",
                        id.short(),
                        task.id.short()
                    ))
                })
            })
            .collect()
    }

    fn stem(task: &ConcreteTask) -> String {
        task.inputs
            .first()
            .and_then(|id| Self::staged_name(task, &id.to_string()))
            .and_then(|name| name.split('.').next().map(str::to_string))
            .unwrap_or_else(|| task.operation.clone())
    }

    /// Name of the primary output in the working directory, if any.
    pub fn output_name(&self, task: &ConcreteTask) -> Result<Option<String>> {
        if let Some(name) = task.params.framework_str(framework_keys::FINAL_OUTPUT_NAME) {
            return Ok(Some(name.to_string()));
        }
        let Some(template) = &self.command.output else {
            return Ok(None);
        };
        let stem = Self::stem(task);
        let rendered = render(template, |key| match key {
            "stem" => Ok(stem.clone()),
            "run" => Ok(task.run_number.to_string()),
            "task" => Ok(task.id.short()),
            other => param_text(task, other),
        })?;
        Ok(Some(rendered))
    }

    /// Flags for every set option whose minimum tool version is met.
    fn flags(&self, task: &ConcreteTask, version: Option<&ToolVersion>) -> Result<Vec<String>> {
        let mut flags = Vec::new();
        for spec in &self.schema {
            let Some(flag) = &spec.flag else { continue };
            let Some(value) = task.params.tool.get(&spec.name) else {
                continue;
            };
            if let Some(minimum) = &spec.min_version {
                let supported = match version {
                    Some(v) => v.is_at_least(minimum)?,
                    None => false,
                };
                if !supported {
                    tracing::debug!(option = %spec.name, minimum = %minimum, "Option gated out of command");
                    continue;
                }
            }
            match value {
                Value::Null | Value::Bool(false) => {}
                Value::Bool(true) => flags.push(flag.clone()),
                other => flags.push(format!("{} {}", flag, shell_quote(&value_text(other)))),
            }
        }
        Ok(flags)
    }

    fn find_markers(&self, workdir: &std::path::Path) -> Vec<std::path::PathBuf> {
        let Some(pattern) = &self.command.marker_pattern else {
            return Vec::new();
        };
        WalkDir::new(workdir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() || e.file_type().is_symlink())
            .filter(|e| pattern.is_match(&e.file_name().to_string_lossy()))
            .map(|e| e.into_path())
            .collect()
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

fn param_text(task: &ConcreteTask, key: &str) -> Result<String> {
    task.params
        .tool
        .get(key)
        .map(value_text)
        .ok_or_else(|| Error::Validation(format!("Unknown placeholder {{{}}}", key)))
}

fn render(template: &str, mut lookup: impl FnMut(&str) -> Result<String>) -> Result<String> {
    let mut failure = None;
    let rendered = PLACEHOLDER_RE.replace_all(template, |caps: &Captures| {
        match lookup(&caps[1]) {
            Ok(text) => text,
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(rendered.into_owned()),
    }
}

#[async_trait]
impl TaskPlugin for TemplatePlugin {
    fn default_parameters(&self) -> BTreeMap<String, Value> {
        self.defaults.clone()
    }

    async fn setup(&self, ctx: &mut HookContext<'_>) -> Result<bool> {
        let staged = ctx.stage_all().await?;
        let names: serde_json::Map<String, Value> = staged
            .iter()
            .map(|(artifact, _)| (artifact.id.to_string(), Value::String(artifact.name.clone())))
            .collect();
        ctx.task
            .params
            .framework
            .insert(STAGED_NAMES.to_string(), Value::Object(names));
        Ok(true)
    }

    fn build_commands(
        &self,
        task: &ConcreteTask,
        version: Option<&ToolVersion>,
    ) -> Result<Vec<String>> {
        let Some(template) = &self.command.template else {
            return Ok(Vec::new());
        };
        let inputs = Self::input_names(task)?;
        let output = self.output_name(task)?.unwrap_or_default();
        let flags = self.flags(task, version)?.join(" ");
        let stem = Self::stem(task);

        template
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let rendered = render(line, |key| match key {
                    "input" => inputs
                        .first()
                        .map(|n| shell_quote(n))
                        .ok_or_else(|| Error::Validation("Command needs an input".to_string())),
                    "inputs" => Ok(inputs
                        .iter()
                        .map(|n| shell_quote(n))
                        .collect::<Vec<_>>()
                        .join(" ")),
                    "output" => Ok(shell_quote(&output)),
                    "stem" => Ok(shell_quote(&stem)),
                    "flags" => Ok(flags.clone()),
                    "run" => Ok(task.run_number.to_string()),
                    "task" => Ok(task.id.short()),
                    other => match other.strip_prefix("companion.") {
                        Some(key) => task
                            .params
                            .companion(key)
                            .and_then(|id| Self::staged_name(task, &id.to_string()))
                            .map(|n| shell_quote(&n))
                            .ok_or_else(|| {
                                Error::Validation(format!("Companion '{}' was not resolved", key))
                            }),
                        None => param_text(task, other).map(|v| shell_quote(&v)),
                    },
                })?;
                // Collapse the gap an empty {flags} leaves behind.
                Ok(rendered.split_whitespace().collect::<Vec<_>>().join(" "))
            })
            .collect()
    }

    async fn save_results(&self, ctx: &mut HookContext<'_>) -> Result<bool> {
        let Some(name) = self.output_name(ctx.task)? else {
            return Ok(true);
        };
        let workdir = ctx.workdir()?.to_path_buf();
        let local = workdir.join(&name);
        let sources = ctx.staged_artifact_ids();

        // A step without a job assembles its collection from what it staged.
        if self.command.template.is_none()
            && self.command.output_kind == ArtifactKind::Collection
            && tokio::fs::symlink_metadata(&local).await.is_err()
        {
            let staged: Vec<String> = sources
                .iter()
                .filter_map(|id| Self::staged_name(ctx.task, &id.to_string()))
                .collect();
            let (dir, root) = (local.clone(), workdir.clone());
            blocking(move || {
                std::fs::create_dir_all(&dir)?;
                for member in staged {
                    util::copy_tree(&root.join(&member), &dir.join(&member))?;
                }
                Ok(())
            })
            .await?;
        }

        if tokio::fs::symlink_metadata(&local).await.is_err() {
            return Err(Error::MissingOutput(name));
        }

        let parent = sources.first().copied();
        let target = ctx
            .output_target(&name, self.command.output_kind, parent)
            .await?;

        let artifact = ctx.destage_output(&name, target).await?;
        if let Some(parent) = parent {
            ctx.attach_output(artifact.id, parent).await?;
        }
        ctx.record_derivation(&sources, &[artifact.id], Some(&self.operation))?;
        Ok(true)
    }

    fn estimate_walltime(&self, _task: &ConcreteTask) -> Duration {
        self.walltime
    }

    fn success_predicate(&self, outcome: &JobOutcome) -> bool {
        if outcome.cancelled || outcome.exit_code != Some(0) {
            return false;
        }
        let matches = |re: &Regex| re.is_match(&outcome.stdout) || re.is_match(&outcome.stderr);
        if self.command.error_pattern.as_ref().is_some_and(matches) {
            return false;
        }
        self.command.success_pattern.as_ref().map_or(true, matches)
    }

    fn supports_recovery(&self, phase: Phase) -> bool {
        self.recoverable.contains(&phase)
    }

    async fn recover_from_failure(&self, phase: Phase, ctx: &mut HookContext<'_>) -> Result<bool> {
        let workdir = ctx.workdir()?.to_path_buf();
        let markers = self.find_markers(&workdir);
        for marker in &markers {
            tokio::fs::remove_file(marker).await?;
            ctx.task.add_log(&format!(
                "Removed stale marker {} before recovering {}",
                marker.display(),
                phase
            ));
        }
        Ok(true)
    }

    fn supports_restart(&self, phase: Phase) -> bool {
        self.restartable.contains(&phase)
    }
}
