//! TOML operation manifests.
//!
//! ```toml
//! [[operation]]
//! id = "fsl_bet"
//! tool = "bet"
//! mode = "per_input"
//! recoverable = ["setup", "execute", "post_processing"]
//! restartable = ["setup", "execute", "post_processing"]
//!
//! [operation.applicability]
//! kinds = ["single_file"]
//! formats = ["nii", "nii.gz"]
//!
//! [operation.command]
//! template = "bet {input} {output} {flags}"
//! output = "{stem}_brain.nii.gz"
//! error_pattern = "ERROR"
//!
//! [[operation.params]]
//! name = "fractional_intensity"
//! kind = "float"
//! min = 0.0
//! max = 1.0
//! default = 0.5
//! flag = "-f"
//! ```

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{ArtifactKind, Phase};
use crate::plugin::template::{CommandTemplate, TemplatePlugin};
use crate::registry::{
    Applicability, CompanionRule, FanInSpec, FanOutMode, OperationDescriptor, ParamKind,
    ParamSpec, SortKey, DEFAULT_MAX_INPUTS,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "operation")]
    pub operations: Vec<OperationManifest>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationManifest {
    pub id: String,
    pub tool: Option<String>,
    #[serde(default)]
    pub mode: FanOutMode,
    #[serde(default)]
    pub sort_key: SortKey,
    pub min_inputs: Option<usize>,
    pub max_inputs: Option<usize>,
    #[serde(default)]
    pub strict_inputs: bool,
    #[serde(default)]
    pub side_effect_free: bool,
    #[serde(default)]
    pub recoverable: Vec<Phase>,
    #[serde(default)]
    pub restartable: Vec<Phase>,
    pub walltime_secs: Option<u64>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    #[serde(default)]
    pub applicability: ApplicabilityManifest,
    #[serde(default)]
    pub companions: Vec<CompanionRule>,
    pub fan_in: Option<FanInSpec>,
    #[serde(default)]
    pub command: CommandManifest,
    #[serde(default)]
    pub params: Vec<ParamManifest>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicabilityManifest {
    #[serde(default)]
    pub kinds: Vec<ArtifactKind>,
    #[serde(default)]
    pub formats: Vec<String>,
    pub name_pattern: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandManifest {
    /// Absent for operations that submit no job.
    pub template: Option<String>,
    pub output: Option<String>,
    pub output_kind: Option<ArtifactKind>,
    pub success_pattern: Option<String>,
    pub error_pattern: Option<String>,
    /// File names left behind by an interrupted run, removed on recovery.
    pub marker_pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKindName {
    Text,
    Integer,
    Float,
    Bool,
    Choice,
    IntegerList,
    Filename,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamManifest {
    pub name: String,
    pub kind: ParamKindName,
    #[serde(default)]
    pub required: bool,
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default)]
    pub choices: Vec<String>,
    pub min_version: Option<String>,
    pub flag: Option<String>,
    pub exclusive_group: Option<String>,
}

impl ParamManifest {
    fn into_spec(self) -> Result<ParamSpec> {
        let kind = match self.kind {
            ParamKindName::Text => ParamKind::Text,
            ParamKindName::Integer => ParamKind::Integer {
                min: self.min.map(|v| v as i64),
                max: self.max.map(|v| v as i64),
            },
            ParamKindName::Float => ParamKind::Float {
                min: self.min,
                max: self.max,
            },
            ParamKindName::Bool => ParamKind::Bool,
            ParamKindName::Choice => {
                if self.choices.is_empty() {
                    return Err(Error::Validation(format!(
                        "Choice parameter '{}' declares no choices",
                        self.name
                    )));
                }
                ParamKind::Choice {
                    values: self.choices,
                }
            }
            ParamKindName::IntegerList => ParamKind::IntegerList,
            ParamKindName::Filename => ParamKind::Filename,
        };
        if let Some(min_version) = &self.min_version {
            crate::version::ToolVersion::parse(min_version)?;
        }
        Ok(ParamSpec {
            name: self.name,
            kind,
            required: self.required,
            default: self.default,
            min_version: self.min_version,
            flag: self.flag,
            exclusive_group: self.exclusive_group,
        })
    }
}

fn compile(pattern: Option<String>) -> Result<Option<Regex>> {
    pattern.map(|p| Regex::new(&p)).transpose().map_err(Error::from)
}

impl OperationManifest {
    pub fn into_descriptor(self) -> Result<OperationDescriptor> {
        let schema = self
            .params
            .into_iter()
            .map(ParamManifest::into_spec)
            .collect::<Result<Vec<_>>>()?;

        let command = CommandTemplate {
            template: self.command.template,
            output: self.command.output,
            output_kind: self.command.output_kind.unwrap_or(ArtifactKind::SingleFile),
            success_pattern: compile(self.command.success_pattern)?,
            error_pattern: compile(self.command.error_pattern)?,
            marker_pattern: compile(self.command.marker_pattern)?,
        };

        let mut plugin = TemplatePlugin::new(&self.id, command)
            .with_schema(schema.clone())
            .with_defaults(self.defaults)
            .recoverable(&self.recoverable)
            .restartable(&self.restartable);
        if let Some(secs) = self.walltime_secs {
            plugin = plugin.with_walltime(Duration::from_secs(secs));
        }

        let applicability = Applicability {
            kinds: self.applicability.kinds,
            formats: self.applicability.formats,
            name_pattern: compile(self.applicability.name_pattern)?,
        };

        let mut descriptor = OperationDescriptor::new(&self.id, Arc::new(plugin))
            .with_mode(self.mode)
            .with_sort_key(self.sort_key)
            .with_applicability(applicability)
            .with_input_limits(
                self.min_inputs.unwrap_or(1),
                self.max_inputs.unwrap_or(DEFAULT_MAX_INPUTS),
            );
        descriptor.tool = self.tool;
        descriptor.schema = schema;
        descriptor.strict_inputs = self.strict_inputs;
        descriptor.side_effect_free = self.side_effect_free;
        descriptor.companions = self.companions;
        descriptor.fan_in = self.fan_in;
        Ok(descriptor)
    }
}

impl Manifest {
    pub fn into_descriptors(self) -> Result<Vec<OperationDescriptor>> {
        self.operations
            .into_iter()
            .map(OperationManifest::into_descriptor)
            .collect()
    }
}
