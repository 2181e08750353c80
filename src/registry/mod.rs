//! Data-driven operation registry.
//!
//! Each operation is described by an `OperationDescriptor`: which artifacts
//! it accepts, its parameter schema, how a request fans out, and the plugin
//! that supplies the lifecycle hooks. Descriptors are registered in code or
//! loaded from TOML manifests and resolved by id at runtime.

pub mod manifest;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::core::{Artifact, ArtifactKind};
use crate::plugin::TaskPlugin;
use crate::{Error, Result};

pub use manifest::Manifest;

/// Largest selection a single request may carry.
pub const DEFAULT_MAX_INPUTS: usize = 1000;

/// How one request expands into concrete tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutMode {
    /// One task per qualifying input.
    #[default]
    PerInput,
    /// One task over the whole selection.
    Batch,
}

/// Ordering of per-input tasks; only affects default descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Name,
    Id,
    /// Order the user selected the inputs in.
    Selection,
}

/// Declared predicate an input artifact must satisfy.
#[derive(Debug, Clone, Default)]
pub struct Applicability {
    /// Accepted kinds; empty accepts any.
    pub kinds: Vec<ArtifactKind>,
    /// Accepted format tags; empty accepts any.
    pub formats: Vec<String>,
    pub name_pattern: Option<Regex>,
}

impl Applicability {
    /// `Err(reason)` when the artifact does not qualify.
    pub fn check(&self, artifact: &Artifact) -> std::result::Result<(), String> {
        if !self.kinds.is_empty() && !self.kinds.contains(&artifact.kind) {
            return Err(format!("{} is a {}", artifact.name, artifact.kind));
        }
        if !self.formats.is_empty() {
            let matches = artifact
                .format
                .as_deref()
                .is_some_and(|f| self.formats.iter().any(|x| x.eq_ignore_ascii_case(f)));
            if !matches {
                return Err(format!(
                    "{} is not one of: {}",
                    artifact.name,
                    self.formats.join(", ")
                ));
            }
        }
        if let Some(pattern) = &self.name_pattern {
            if !pattern.is_match(&artifact.name) {
                return Err(format!(
                    "{} does not match {}",
                    artifact.name,
                    pattern.as_str()
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    Text,
    Integer { min: Option<i64>, max: Option<i64> },
    Float { min: Option<f64>, max: Option<f64> },
    Bool,
    Choice { values: Vec<String> },
    /// Comma or whitespace separated integers, normalized to a list.
    IntegerList,
    /// A user-chosen output name; must be a legal file name.
    Filename,
}

/// One entry of an operation's parameter schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<Value>,
    /// Tool version the option first appeared in.
    pub min_version: Option<String>,
    /// Command line flag emitted for this option.
    pub flag: Option<String>,
    /// At most one option per group may be set.
    pub exclusive_group: Option<String>,
}

impl ParamSpec {
    pub fn new(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
            default: None,
            min_version: None,
            flag: None,
            exclusive_group: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_min_version(mut self, version: &str) -> Self {
        self.min_version = Some(version.to_string());
        self
    }

    pub fn with_flag(mut self, flag: &str) -> Self {
        self.flag = Some(flag.to_string());
        self
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.exclusive_group = Some(group.to_string());
        self
    }
}

/// Locate sibling artifacts by swapping a token in the input's name,
/// e.g. `sub01_t1.mnc` -> `sub01_t2.mnc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionRule {
    pub token: String,
    /// companion key -> replacement token
    pub replacements: BTreeMap<String, String>,
}

impl CompanionRule {
    /// Expected companion names for `name`, keyed by companion key.
    ///
    /// Only the last occurrence of the token is replaced.
    pub fn expected_names(&self, name: &str) -> BTreeMap<String, String> {
        let Some(pos) = name.rfind(&self.token) else {
            return BTreeMap::new();
        };
        self.replacements
            .iter()
            .map(|(key, replacement)| {
                let mut candidate = String::with_capacity(name.len());
                candidate.push_str(&name[..pos]);
                candidate.push_str(replacement);
                candidate.push_str(&name[pos + self.token.len()..]);
                (key.clone(), candidate)
            })
            .collect()
    }
}

/// A follow-up task that runs once every fanned-out task has completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanInSpec {
    pub operation: String,
    /// Request parameter that must be truthy for the fan-in to be added.
    pub trigger_param: String,
    /// Request parameters copied into the fan-in task.
    #[serde(default)]
    pub params: Vec<String>,
    /// Run in the first fanned-out task's working directory.
    #[serde(default)]
    pub share_workdir: bool,
}

pub struct OperationDescriptor {
    pub id: String,
    /// External tool whose version gates options; `None` for pure framework steps.
    pub tool: Option<String>,
    pub mode: FanOutMode,
    pub sort_key: SortKey,
    pub applicability: Applicability,
    pub schema: Vec<ParamSpec>,
    pub min_inputs: usize,
    pub max_inputs: usize,
    /// Reject the request when any selected input does not qualify.
    pub strict_inputs: bool,
    /// Completes without producing provenance.
    pub side_effect_free: bool,
    pub companions: Vec<CompanionRule>,
    pub fan_in: Option<FanInSpec>,
    pub plugin: Arc<dyn TaskPlugin>,
}

impl OperationDescriptor {
    pub fn new(id: &str, plugin: Arc<dyn TaskPlugin>) -> Self {
        Self {
            id: id.to_string(),
            tool: None,
            mode: FanOutMode::PerInput,
            sort_key: SortKey::Name,
            applicability: Applicability::default(),
            schema: Vec::new(),
            min_inputs: 1,
            max_inputs: DEFAULT_MAX_INPUTS,
            strict_inputs: false,
            side_effect_free: false,
            companions: Vec::new(),
            fan_in: None,
            plugin,
        }
    }

    pub fn with_tool(mut self, tool: &str) -> Self {
        self.tool = Some(tool.to_string());
        self
    }

    pub fn with_mode(mut self, mode: FanOutMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_sort_key(mut self, sort_key: SortKey) -> Self {
        self.sort_key = sort_key;
        self
    }

    pub fn with_applicability(mut self, applicability: Applicability) -> Self {
        self.applicability = applicability;
        self
    }

    pub fn with_param(mut self, spec: ParamSpec) -> Self {
        self.schema.push(spec);
        self
    }

    pub fn with_input_limits(mut self, min: usize, max: usize) -> Self {
        self.min_inputs = min;
        self.max_inputs = max;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict_inputs = true;
        self
    }

    pub fn side_effect_free(mut self) -> Self {
        self.side_effect_free = true;
        self
    }

    pub fn with_companion(mut self, rule: CompanionRule) -> Self {
        self.companions.push(rule);
        self
    }

    pub fn with_fan_in(mut self, fan_in: FanInSpec) -> Self {
        self.fan_in = Some(fan_in);
        self
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.schema.iter().find(|p| p.name == name)
    }
}

impl std::fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("id", &self.id)
            .field("tool", &self.tool)
            .field("mode", &self.mode)
            .field("params", &self.schema.len())
            .field("fan_in", &self.fan_in.as_ref().map(|f| &f.operation))
            .finish()
    }
}

/// Operation id -> descriptor table.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: BTreeMap<String, Arc<OperationDescriptor>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any previous one with the same id.
    pub fn register(&mut self, descriptor: OperationDescriptor) {
        if self.operations.contains_key(&descriptor.id) {
            tracing::warn!(operation = %descriptor.id, "Replacing registered operation");
        }
        self.operations
            .insert(descriptor.id.clone(), Arc::new(descriptor));
    }

    pub fn get(&self, id: &str) -> Result<Arc<OperationDescriptor>> {
        self.operations
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownOperation(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.operations.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.operations.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Register every operation of a TOML manifest. Returns how many.
    pub fn load_manifest_str(&mut self, content: &str) -> Result<usize> {
        let manifest: Manifest = toml::from_str(content)?;
        let descriptors = manifest.into_descriptors()?;
        let count = descriptors.len();
        for descriptor in descriptors {
            tracing::debug!(operation = %descriptor.id, "Registered operation from manifest");
            self.register(descriptor);
        }
        Ok(count)
    }

    pub fn load_manifest(&mut self, path: &Path) -> Result<usize> {
        tracing::debug!(path = %path.display(), "Loading operation manifest");
        let content = std::fs::read_to_string(path)?;
        self.load_manifest_str(&content)
    }

    /// Check that every fan-in target is registered.
    pub fn validate(&self) -> Result<()> {
        for descriptor in self.operations.values() {
            if let Some(fan_in) = &descriptor.fan_in {
                if !self.contains(&fan_in.operation) {
                    return Err(Error::Validation(format!(
                        "Operation '{}' fans in to unknown operation '{}'",
                        descriptor.id, fan_in.operation
                    )));
                }
            }
        }
        Ok(())
    }
}
