use thiserror::Error;

use crate::core::{ArtifactId, Phase, RequestId, TaskId};
use crate::validation::FieldErrors;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parameter errors:\n{0}")]
    AggregatedValidation(FieldErrors),

    #[error("No qualifying input for operation '{operation}'")]
    NoQualifyingInput { operation: String },

    #[error("Sync error on artifact {artifact}: {reason}")]
    Sync { artifact: ArtifactId, reason: String },

    #[error("Malformed version: no numeric version found in '{0}'")]
    MalformedVersion(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(ArtifactId),

    #[error("Expected output {0} was not produced")]
    MissingOutput(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Operation '{operation}' cannot recover from a {phase} failure")]
    RecoveryUnsupported { operation: String, phase: Phase },

    #[error("Operation '{operation}' cannot restart at {phase}")]
    RestartUnsupported { operation: String, phase: Phase },

    #[error("Record schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("Execution environment error: {0}")]
    Environment(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
