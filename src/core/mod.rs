//! Core domain models for the task lifecycle.
//!
//! Requests, the concrete tasks they fan out into, the artifacts those tasks
//! consume and produce, and the prerequisite graph between tasks.

pub mod artifact;
pub mod dag;
pub mod request;
pub mod task;

pub use artifact::{Artifact, ArtifactId, ArtifactKind, SyncState, SyncStatus};
pub use dag::TaskDAG;
pub use request::{EnvironmentRef, RequestId, TaskRequest};
pub use task::{
    framework_keys, ConcreteTask, FailureReport, JobHandle, Phase, ReasonCode,
    StatusHistoryEntry, TaskId, TaskParams, TaskStatus, CURRENT_TASK_SCHEMA,
};

/// Declares a UUID v4 newtype id with a short display form.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// First 8 characters of the UUID for display.
            pub fn short(&self) -> String {
                self.0.to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }
        }
    };
}

pub(crate) use define_id;
