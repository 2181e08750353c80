//! Durable artifact store boundary.
//!
//! The store holds artifact records and their content. `DirStore` keeps
//! both on a local directory:
//!
//! ```text
//! <root>/records/<id>.json     artifact record
//! <root>/objects/<id>/<name>   content (file or tree)
//! <root>/staging/              publish scratch space
//! ```

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};

use crate::core::{Artifact, ArtifactId, ArtifactKind};
use crate::util::{self, blocking};
use crate::{Error, Result};

/// Where destaged content goes.
#[derive(Debug, Clone, PartialEq)]
pub enum DestageTarget {
    /// Create a new artifact with a pre-allocated id.
    New {
        id: ArtifactId,
        name: String,
        kind: ArtifactKind,
        format: Option<String>,
        parent: Option<ArtifactId>,
    },
    /// Replace the content of an existing artifact.
    Existing(ArtifactId),
}

impl DestageTarget {
    pub fn new_artifact(name: &str, kind: ArtifactKind) -> Self {
        DestageTarget::New {
            id: ArtifactId::new(),
            name: name.to_string(),
            kind,
            format: crate::core::artifact::infer_format(name, kind),
            parent: None,
        }
    }

    pub fn with_parent(self, parent: ArtifactId) -> Self {
        match self {
            DestageTarget::New {
                id,
                name,
                kind,
                format,
                ..
            } => DestageTarget::New {
                id,
                name,
                kind,
                format,
                parent: Some(parent),
            },
            existing => existing,
        }
    }

    /// Use `id` instead of a freshly allocated one.
    pub fn with_id(self, id: ArtifactId) -> Self {
        match self {
            DestageTarget::New {
                name,
                kind,
                format,
                parent,
                ..
            } => DestageTarget::New {
                id,
                name,
                kind,
                format,
                parent,
            },
            existing => existing,
        }
    }

    pub fn artifact_id(&self) -> ArtifactId {
        match self {
            DestageTarget::New { id, .. } => *id,
            DestageTarget::Existing(id) => *id,
        }
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Name of this store, matched against a task's `results_store_id`.
    fn id(&self) -> &str;

    async fn describe(&self, id: ArtifactId) -> Result<Artifact>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Artifact>>;

    async fn list(&self) -> Result<Vec<Artifact>>;

    /// Copy the artifact's content to `dest`, which must not exist.
    async fn fetch(&self, id: ArtifactId, dest: &Path) -> Result<()>;

    /// Publish `source` as the artifact's content, bumping its version.
    ///
    /// All-or-nothing: on error the durable record still references the
    /// previous complete content (or does not exist).
    async fn publish(&self, source: &Path, target: &DestageTarget) -> Result<Artifact>;

    async fn set_parent(&self, id: ArtifactId, parent: Option<ArtifactId>) -> Result<Artifact>;
}

/// Directory-backed artifact store.
#[derive(Debug, Clone)]
pub struct DirStore {
    id: String,
    root: PathBuf,
}

impl DirStore {
    pub async fn open(id: &str, root: &Path) -> Result<Self> {
        for sub in ["records", "objects", "staging"] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }
        tracing::debug!(store = id, root = %root.display(), "Opened artifact store");
        Ok(Self {
            id: id.to_string(),
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: ArtifactId) -> PathBuf {
        self.root.join("records").join(format!("{}.json", id))
    }

    fn object_dir(&self, id: ArtifactId) -> PathBuf {
        self.root.join("objects").join(id.to_string())
    }

    /// Import an existing file or directory as a new artifact.
    pub async fn import(&self, source: &Path, parent: Option<ArtifactId>) -> Result<Artifact> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Validation(format!("Cannot import {}", source.display())))?;
        let kind = if tokio::fs::metadata(source).await?.is_dir() {
            ArtifactKind::Collection
        } else {
            ArtifactKind::SingleFile
        };
        let mut target = DestageTarget::new_artifact(&name, kind);
        if let Some(parent) = parent {
            target = target.with_parent(parent);
        }
        self.publish(source, &target).await
    }

    async fn write_record(&self, artifact: &Artifact) -> Result<()> {
        util::write_json_atomic(&self.record_path(artifact.id), artifact).await
    }

    /// Copy `source` into a fresh staging directory, returning it.
    async fn stage(&self, source: &Path, name: &str) -> Result<PathBuf> {
        let staging = util::temp_sibling(&self.root.join("staging").join(name), "publish");
        let src = source.to_path_buf();
        let dest = staging.join(name);
        let scratch = staging.clone();
        blocking(move || {
            util::copy_tree(&src, &dest).inspect_err(|_| {
                let _ = util::remove_path(&scratch);
            })
        })
        .await?;
        Ok(staging)
    }
}

#[async_trait]
impl ArtifactStore for DirStore {
    fn id(&self) -> &str {
        &self.id
    }

    async fn describe(&self, id: ArtifactId) -> Result<Artifact> {
        match tokio::fs::read_to_string(self.record_path(id)).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::ArtifactNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Artifact>> {
        Ok(self.list().await?.into_iter().find(|a| a.name == name))
    }

    async fn list(&self) -> Result<Vec<Artifact>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("records")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Artifact>(&content) {
                Ok(artifact) => out.push(artifact),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable artifact record")
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn fetch(&self, id: ArtifactId, dest: &Path) -> Result<()> {
        let artifact = self.describe(id).await?;
        let src = self.object_dir(id).join(&artifact.name);
        let dest = dest.to_path_buf();
        blocking(move || util::copy_tree(&src, &dest)).await
    }

    async fn publish(&self, source: &Path, target: &DestageTarget) -> Result<Artifact> {
        let now = Utc::now();
        let (artifact, previous) = match target {
            DestageTarget::New {
                id,
                name,
                kind,
                format,
                parent,
            } => {
                if tokio::fs::try_exists(self.record_path(*id)).await? {
                    return Err(Error::Validation(format!("Artifact {} already exists", id)));
                }
                let artifact = Artifact {
                    id: *id,
                    name: name.clone(),
                    kind: *kind,
                    format: format.clone(),
                    version: 1,
                    parent: *parent,
                    created_at: now,
                    updated_at: now,
                };
                (artifact, None)
            }
            DestageTarget::Existing(id) => {
                let previous = self.describe(*id).await?;
                let mut artifact = previous.clone();
                artifact.version += 1;
                artifact.updated_at = now;
                (artifact, Some(previous))
            }
        };

        let staging = self.stage(source, &artifact.name).await?;
        let object_dir = self.object_dir(artifact.id);
        let retired = util::temp_sibling(&object_dir, "retired");

        if tokio::fs::try_exists(&object_dir).await? {
            if previous.is_some() {
                tokio::fs::rename(&object_dir, &retired).await?;
            } else {
                // Content without a record is left over from an interrupted publish.
                let orphan = object_dir.clone();
                blocking(move || util::remove_path(&orphan)).await?;
            }
        }
        if let Err(e) = tokio::fs::rename(&staging, &object_dir).await {
            if tokio::fs::try_exists(&retired).await.unwrap_or(false) {
                let _ = tokio::fs::rename(&retired, &object_dir).await;
            }
            let _ = blocking(move || util::remove_path(&staging)).await;
            return Err(e.into());
        }

        if let Err(e) = self.write_record(&artifact).await {
            let failed = object_dir.clone();
            let _ = blocking(move || util::remove_path(&failed)).await;
            if tokio::fs::try_exists(&retired).await.unwrap_or(false) {
                let _ = tokio::fs::rename(&retired, &object_dir).await;
            }
            return Err(e);
        }

        let _ = blocking(move || util::remove_path(&retired)).await;
        tracing::info!(
            store = %self.id,
            artifact = %artifact.id.short(),
            name = %artifact.name,
            version = artifact.version,
            "Published artifact"
        );
        Ok(artifact)
    }

    async fn set_parent(&self, id: ArtifactId, parent: Option<ArtifactId>) -> Result<Artifact> {
        let mut artifact = self.describe(id).await?;
        artifact.parent = parent;
        artifact.updated_at = Utc::now();
        self.write_record(&artifact).await?;
        Ok(artifact)
    }
}
