//! User-submitted task requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::artifact::ArtifactId;
use crate::core::define_id;
use crate::{Error, Result};

define_id!(
    /// Unique identifier for a task request.
    RequestId
);

/// Where a request's tasks run and which tool version they expect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRef {
    pub name: String,
    /// Overrides the probed tool version when set.
    #[serde(default)]
    pub tool_version: Option<String>,
}

impl EnvironmentRef {
    pub fn local() -> Self {
        Self {
            name: "local".to_string(),
            tool_version: None,
        }
    }
}

/// One logical submission: selected inputs plus shared parameters.
///
/// Sealed once planning starts; a sealed request is never planned again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: RequestId,
    pub operation: String,
    pub inputs: Vec<ArtifactId>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub environment: EnvironmentRef,
    #[serde(default)]
    pub results_store_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sealed_at: Option<DateTime<Utc>>,
}

impl TaskRequest {
    pub fn new(operation: &str, inputs: Vec<ArtifactId>) -> Self {
        Self {
            id: RequestId::new(),
            operation: operation.to_string(),
            inputs,
            params: BTreeMap::new(),
            description: None,
            environment: EnvironmentRef::local(),
            results_store_id: None,
            created_at: Utc::now(),
            sealed_at: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentRef) -> Self {
        self.environment = environment;
        self
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_at.is_some()
    }

    pub fn seal(&mut self) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::Validation(format!(
                "Request {} has already been planned",
                self.id.short()
            )));
        }
        self.sealed_at = Some(Utc::now());
        Ok(())
    }
}
