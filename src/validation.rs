//! Two-phase parameter validation.
//!
//! `pre_dispatch` filters the selection and normalizes the request's
//! parameters; hard problems fail immediately. `post_submission` checks
//! field values and collects every violation before failing. Both phases
//! drop options the resolved tool version does not support before looking
//! at them.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::core::{framework_keys, Artifact, ArtifactId, TaskRequest};
use crate::plugin::PreDispatchContext;
use crate::registry::{OperationDescriptor, ParamKind, ParamSpec};
use crate::version::ToolVersion;
use crate::{Error, Result};

static LEGAL_FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][\w~!@#%^&*()+=:{}|<>,.?\[\]\-]*$").unwrap());

static LIST_SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[,\s]+").unwrap());

/// Whether `name` can be used as a user-chosen output name.
///
/// Must start with a letter or digit and may not contain path separators,
/// quotes, spaces or control characters.
pub fn is_legal_filename(name: &str) -> bool {
    name != "." && name != ".." && LEGAL_FILENAME_RE.is_match(name)
}

/// Field name to every message reported against it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of fields with at least one error.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn messages(&self, field: &str) -> &[String] {
        self.0.get(field).map(Vec::as_slice).unwrap_or_default()
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for message in messages {
                if !first {
                    writeln!(f)?;
                }
                write!(f, "  {}: {}", field, message)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Output of the pre-dispatch phase.
#[derive(Debug, Clone)]
pub struct NormalizedParams {
    /// Qualifying inputs, in selection order.
    pub inputs: Vec<Artifact>,
    /// Inputs filtered out, with the reason.
    pub rejected: Vec<(ArtifactId, String)>,
    /// Parameters shared by every task of the request.
    pub params: BTreeMap<String, Value>,
    /// Framework keys specific to one input, e.g. resolved companions.
    pub per_input: BTreeMap<ArtifactId, BTreeMap<String, Value>>,
    pub version: Option<ToolVersion>,
    pub notices: Vec<String>,
    /// Options removed because the tool version does not support them.
    pub dropped: Vec<String>,
}

/// Output of the post-submission phase; what the planner consumes.
#[derive(Debug, Clone)]
pub struct FinalParams {
    pub inputs: Vec<Artifact>,
    pub params: BTreeMap<String, Value>,
    pub per_input: BTreeMap<ArtifactId, BTreeMap<String, Value>>,
    pub version: Option<ToolVersion>,
    pub notices: Vec<String>,
    pub dropped: Vec<String>,
}

pub struct ParameterPipeline<'a> {
    descriptor: &'a OperationDescriptor,
    version: Option<ToolVersion>,
}

impl<'a> ParameterPipeline<'a> {
    /// `version` is the resolved tool version, `None` when it is unknown.
    pub fn new(descriptor: &'a OperationDescriptor, version: Option<ToolVersion>) -> Self {
        Self {
            descriptor,
            version,
        }
    }

    /// Run both phases.
    pub fn validate(
        &self,
        request: &TaskRequest,
        candidates: &[Artifact],
        catalog: &[Artifact],
    ) -> Result<FinalParams> {
        let normalized = self.pre_dispatch(request, candidates, catalog)?;
        self.post_submission(normalized)
    }

    /// Filter inputs, merge defaults, gate options and resolve companions.
    ///
    /// `catalog` is searched for companion artifacts by name.
    pub fn pre_dispatch(
        &self,
        request: &TaskRequest,
        candidates: &[Artifact],
        catalog: &[Artifact],
    ) -> Result<NormalizedParams> {
        let descriptor = self.descriptor;
        let mut notices = Vec::new();
        let mut inputs = Vec::new();
        let mut rejected = Vec::new();

        for artifact in candidates {
            let verdict = descriptor.applicability.check(artifact).and_then(|()| {
                if descriptor.plugin.applicability_predicate(artifact) {
                    Ok(())
                } else {
                    Err(format!("{} is not accepted by {}", artifact.name, descriptor.id))
                }
            });
            match verdict {
                Ok(()) => inputs.push(artifact.clone()),
                Err(reason) => rejected.push((artifact.id, reason)),
            }
        }

        if descriptor.strict_inputs && !rejected.is_empty() {
            let reasons: Vec<&str> = rejected.iter().map(|(_, r)| r.as_str()).collect();
            return Err(Error::Validation(reasons.join("; ")));
        }
        for (_, reason) in &rejected {
            notices.push(format!("Skipped: {}", reason));
        }

        // Zero qualifying inputs is reported by the planner.
        if !inputs.is_empty() {
            if inputs.len() < descriptor.min_inputs {
                return Err(Error::Validation(format!(
                    "{} needs at least {} inputs, {} qualify",
                    descriptor.id,
                    descriptor.min_inputs,
                    inputs.len()
                )));
            }
            if inputs.len() > descriptor.max_inputs {
                return Err(Error::Validation(format!(
                    "{} accepts at most {} inputs, {} selected",
                    descriptor.id,
                    descriptor.max_inputs,
                    inputs.len()
                )));
            }
        }

        let mut params = descriptor.plugin.default_parameters();
        for spec in &descriptor.schema {
            if let Some(default) = &spec.default {
                params.insert(spec.name.clone(), default.clone());
            }
        }
        params.extend(request.params.clone());

        let mut dropped = Vec::new();
        self.gate(&mut params, &mut dropped)?;
        for name in &dropped {
            notices.push(format!(
                "Option '{}' is not supported by this tool version and was ignored",
                name
            ));
        }

        let per_input = self.resolve_companions(&inputs, catalog, &mut notices);

        for spec in &descriptor.schema {
            if spec.kind != ParamKind::Filename {
                continue;
            }
            if let Some(value) = params.get(&spec.name) {
                let legal = value.as_str().is_some_and(is_legal_filename);
                if !legal {
                    return Err(Error::Validation(format!(
                        "Output name {} for '{}' contains illegal characters",
                        value, spec.name
                    )));
                }
            }
        }

        let mut ctx = PreDispatchContext {
            request,
            inputs: &inputs,
            params: &mut params,
            version: self.version.as_ref(),
        };
        if let Some(notice) = descriptor.plugin.pre_dispatch_hook(&mut ctx)? {
            notices.push(notice);
        }

        tracing::debug!(
            operation = %descriptor.id,
            qualifying = inputs.len(),
            rejected = rejected.len(),
            dropped = dropped.len(),
            "Pre-dispatch complete"
        );

        Ok(NormalizedParams {
            inputs,
            rejected,
            params,
            per_input,
            version: self.version.clone(),
            notices,
            dropped,
        })
    }

    /// Check every remaining option and report all violations together.
    pub fn post_submission(&self, normalized: NormalizedParams) -> Result<FinalParams> {
        let NormalizedParams {
            inputs,
            mut params,
            per_input,
            version,
            mut notices,
            mut dropped,
            ..
        } = normalized;

        self.gate(&mut params, &mut dropped)?;

        let mut errors = FieldErrors::new();
        for spec in &self.descriptor.schema {
            if dropped.contains(&spec.name) {
                continue;
            }
            match params.get(&spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        errors.add(&spec.name, "is required");
                    }
                }
                Some(value) => match coerce(spec, value) {
                    Ok(canonical) => {
                        params.insert(spec.name.clone(), canonical);
                    }
                    Err(message) => errors.add(&spec.name, message),
                },
            }
        }

        self.check_exclusive_groups(&params, &mut errors);

        if let Some(notice) =
            self.descriptor
                .plugin
                .post_submission_hook(&mut params, &mut errors, self.version.as_ref())?
        {
            notices.push(notice);
        }

        if !errors.is_empty() {
            tracing::debug!(
                operation = %self.descriptor.id,
                fields = errors.len(),
                "Parameter validation failed"
            );
            return Err(Error::AggregatedValidation(errors));
        }

        Ok(FinalParams {
            inputs,
            params,
            per_input,
            version,
            notices,
            dropped,
        })
    }

    /// Remove options whose minimum tool version is not met.
    ///
    /// An unknown version supports no gated option.
    fn gate(&self, params: &mut BTreeMap<String, Value>, dropped: &mut Vec<String>) -> Result<()> {
        for spec in &self.descriptor.schema {
            let Some(minimum) = &spec.min_version else {
                continue;
            };
            if !params.contains_key(&spec.name) {
                continue;
            }
            let supported = match &self.version {
                Some(v) => v.is_at_least(minimum)?,
                None => false,
            };
            if !supported {
                params.remove(&spec.name);
                if !dropped.contains(&spec.name) {
                    dropped.push(spec.name.clone());
                }
                tracing::debug!(
                    option = %spec.name,
                    minimum = %minimum,
                    version = ?self.version.as_ref().map(ToolVersion::raw),
                    "Dropped version-gated option"
                );
            }
        }
        Ok(())
    }

    fn resolve_companions(
        &self,
        inputs: &[Artifact],
        catalog: &[Artifact],
        notices: &mut Vec<String>,
    ) -> BTreeMap<ArtifactId, BTreeMap<String, Value>> {
        let mut per_input = BTreeMap::new();
        if self.descriptor.companions.is_empty() {
            return per_input;
        }
        for input in inputs {
            let mut found = serde_json::Map::new();
            for rule in &self.descriptor.companions {
                for (key, expected) in rule.expected_names(&input.name) {
                    match catalog.iter().find(|a| a.name == expected) {
                        Some(companion) => {
                            found.insert(key, Value::String(companion.id.to_string()));
                        }
                        None => notices.push(format!(
                            "No {} companion found for {} (looked for {})",
                            key, input.name, expected
                        )),
                    }
                }
            }
            if !found.is_empty() {
                let mut overlay = BTreeMap::new();
                overlay.insert(framework_keys::COMPANIONS.to_string(), Value::Object(found));
                per_input.insert(input.id, overlay);
            }
        }
        per_input
    }

    fn check_exclusive_groups(&self, params: &BTreeMap<String, Value>, errors: &mut FieldErrors) {
        let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for spec in &self.descriptor.schema {
            let Some(group) = &spec.exclusive_group else {
                continue;
            };
            let set = match params.get(&spec.name) {
                None | Some(Value::Null) | Some(Value::Bool(false)) => false,
                Some(_) => true,
            };
            if set {
                groups.entry(group.as_str()).or_default().push(&spec.name);
            }
        }
        for members in groups.values().filter(|m| m.len() > 1) {
            for member in members {
                errors.add(
                    member,
                    format!("only one of {} may be set", members.join(", ")),
                );
            }
        }
    }
}

/// Canonical value for `spec`, or the message to report.
fn coerce(spec: &ParamSpec, value: &Value) -> std::result::Result<Value, String> {
    match &spec.kind {
        ParamKind::Text => Ok(match value {
            Value::String(_) => value.clone(),
            other => Value::String(other.to_string()),
        }),
        ParamKind::Integer { min, max } => {
            let n = match value {
                Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                    (Some(i), _) => Some(i),
                    (None, Some(f)) if f.fract() == 0.0 => {
                        // i64::MAX as f64 rounds up to 2^63.
                        if !(i64::MIN as f64..i64::MAX as f64).contains(&f) {
                            return Err(format!("{} is out of range", value));
                        }
                        Some(f as i64)
                    }
                    _ => None,
                },
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            }
            .ok_or_else(|| format!("{} is not an integer", value))?;
            if let Some(min) = min.filter(|m| n < *m) {
                return Err(format!("must be at least {}", min));
            }
            if let Some(max) = max.filter(|m| n > *m) {
                return Err(format!("must be at most {}", max));
            }
            Ok(Value::from(n))
        }
        ParamKind::Float { min, max } => {
            let x = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .filter(|x| x.is_finite())
            .ok_or_else(|| format!("{} is not a number", value))?;
            if let Some(min) = min.filter(|m| x < *m) {
                return Err(format!("must be at least {}", min));
            }
            if let Some(max) = max.filter(|m| x > *m) {
                return Err(format!("must be at most {}", max));
            }
            Ok(Value::from(x))
        }
        ParamKind::Bool => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" | "" => Ok(Value::Bool(false)),
                _ => Err(format!("{} is not a boolean", value)),
            },
            _ => Err(format!("{} is not a boolean", value)),
        },
        ParamKind::Choice { values } => {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if values.contains(&text) {
                Ok(Value::String(text))
            } else {
                Err(format!("must be one of: {}", values.join(", ")))
            }
        }
        ParamKind::IntegerList => {
            let items: Vec<String> = match value {
                Value::Array(items) => items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.trim().to_string(),
                        other => other.to_string(),
                    })
                    .collect(),
                Value::String(s) => LIST_SEPARATOR_RE
                    .split(s.trim())
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect(),
                Value::Number(n) => vec![n.to_string()],
                other => return Err(format!("{} is not a list of integers", other)),
            };
            if items.is_empty() {
                return Err("must list at least one integer".to_string());
            }
            items
                .iter()
                .map(|item| {
                    item.parse::<i64>()
                        .map(Value::from)
                        .map_err(|_| format!("'{}' is not an integer", item))
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        ParamKind::Filename => match value.as_str() {
            Some(name) if is_legal_filename(name) => Ok(Value::String(name.to_string())),
            _ => Err(format!("{} is not a legal file name", value)),
        },
    }
}
