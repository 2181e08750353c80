//! Artifacts held in the durable store and their local cache state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::define_id;

define_id!(
    /// Unique identifier for an artifact.
    ArtifactId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    SingleFile,
    /// A directory tree.
    Collection,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::SingleFile => write!(f, "single_file"),
            ArtifactKind::Collection => write!(f, "collection"),
        }
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "single_file" | "file" => Ok(ArtifactKind::SingleFile),
            "collection" | "dir" | "directory" => Ok(ArtifactKind::Collection),
            other => Err(crate::Error::Validation(format!(
                "Unknown artifact kind: {}",
                other
            ))),
        }
    }
}

/// A named, versioned blob or directory tree in the durable store.
///
/// `parent` is navigational only: outputs are filed under one of their
/// inputs, but the parent does not own them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub name: String,
    pub kind: ArtifactKind,
    #[serde(default)]
    pub format: Option<String>,
    /// Durable content version, bumped on every publish.
    pub version: u64,
    #[serde(default)]
    pub parent: Option<ArtifactId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(name: &str, kind: ArtifactKind) -> Self {
        let now = Utc::now();
        Self {
            id: ArtifactId::new(),
            name: name.to_string(),
            kind,
            format: infer_format(name, kind),
            version: 0,
            parent: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }
}

/// Format tag from a file name: the last extension, or the last two when
/// the last is `gz` (`brain.nii.gz` -> `nii.gz`).
pub fn infer_format(name: &str, kind: ArtifactKind) -> Option<String> {
    if kind == ArtifactKind::Collection {
        return None;
    }
    let parts: Vec<&str> = name.split('.').skip(1).collect();
    match parts.as_slice() {
        [] => None,
        [.., prev, "gz"] => Some(format!("{}.gz", prev.to_ascii_lowercase())),
        [.., last] => Some(last.to_ascii_lowercase()),
    }
}

/// Local cache status of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InSync,
    #[default]
    Stale,
    Syncing,
    /// Recorded in sync but the cached content is gone or unreadable.
    Corrupted,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::InSync => write!(f, "in_sync"),
            SyncStatus::Stale => write!(f, "stale"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Corrupted => write!(f, "corrupted"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub status: SyncStatus,
    /// Durable version the cache slot holds.
    pub synced_version: u64,
    pub last_synced: Option<DateTime<Utc>>,
}

impl SyncState {
    /// In sync with durable version `version`.
    pub fn is_current(&self, version: u64) -> bool {
        self.status == SyncStatus::InSync && self.synced_version >= version
    }
}
