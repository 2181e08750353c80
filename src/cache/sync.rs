//! Local content cache in front of the durable store.
//!
//! Each artifact has one cache slot at `<root>/data/<id>/<name>` and one
//! sync lock. Transfers into a slot only happen under that lock, and the
//! durable record is only republished by the holder, so concurrent
//! `ensure_local` calls collapse into a single transfer.
//!
//! Slot states live in `<root>/sync_state.json`. A slot found `Syncing` on
//! load was interrupted mid-transfer and is treated as Stale.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::store::{ArtifactStore, DestageTarget};
use crate::core::{Artifact, ArtifactId, ConcreteTask, SyncState, SyncStatus};
use crate::util::{self, blocking};
use crate::{Error, Result};

const STATE_FILE: &str = "sync_state.json";

/// How staged inputs appear in a task working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMode {
    #[default]
    Symlink,
    /// For sandboxes that cannot follow links into the cache.
    Copy,
}

pub struct FileSyncCache {
    root: PathBuf,
    store: Arc<dyn ArtifactStore>,
    link_mode: LinkMode,
    entries: Mutex<HashMap<ArtifactId, SyncState>>,
    locks: Mutex<HashMap<ArtifactId, Arc<tokio::sync::Mutex<()>>>>,
    transfers: AtomicUsize,
    persist_lock: tokio::sync::Mutex<()>,
}

impl FileSyncCache {
    /// Open the cache at `root`, loading persisted slot states.
    pub async fn open(
        root: &Path,
        store: Arc<dyn ArtifactStore>,
        link_mode: LinkMode,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(root.join("data")).await?;

        let mut entries = HashMap::new();
        match tokio::fs::read_to_string(root.join(STATE_FILE)).await {
            Ok(content) => {
                let persisted: BTreeMap<String, SyncState> = serde_json::from_str(&content)?;
                for (key, mut state) in persisted {
                    let Ok(id) = key.parse::<ArtifactId>() else {
                        tracing::warn!(key = %key, "Ignoring malformed sync state entry");
                        continue;
                    };
                    if state.status == SyncStatus::Syncing {
                        tracing::warn!(artifact = %id.short(), "Interrupted transfer, marking stale");
                        state.status = SyncStatus::Stale;
                    }
                    entries.insert(id, state);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(
            root = %root.display(),
            entries = entries.len(),
            mode = ?link_mode,
            "Opened file sync cache"
        );

        Ok(Self {
            root: root.to_path_buf(),
            store,
            link_mode,
            entries: Mutex::new(entries),
            locks: Mutex::new(HashMap::new()),
            transfers: AtomicUsize::new(0),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn link_mode(&self) -> LinkMode {
        self.link_mode
    }

    /// Number of store-to-cache transfers performed since open.
    pub fn transfer_count(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    pub fn sync_state(&self, id: ArtifactId) -> SyncState {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&id).cloned())
            .unwrap_or_default()
    }

    pub fn status(&self, id: ArtifactId) -> SyncStatus {
        self.sync_state(id).status
    }

    /// Whether the artifact's current durable version is present locally.
    pub async fn is_local(&self, id: ArtifactId) -> Result<bool> {
        let artifact = self.store.describe(id).await?;
        Ok(self.is_fresh(&artifact).await)
    }

    fn slot_dir(&self, id: ArtifactId) -> PathBuf {
        self.root.join("data").join(id.to_string())
    }

    fn content_path(&self, artifact: &Artifact) -> PathBuf {
        self.slot_dir(artifact.id).join(&artifact.name)
    }

    async fn is_fresh(&self, artifact: &Artifact) -> bool {
        self.sync_state(artifact.id).is_current(artifact.version)
            && tokio::fs::symlink_metadata(self.content_path(artifact))
                .await
                .is_ok()
    }

    fn lock_for(&self, id: ArtifactId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(id).or_default().clone()
    }

    fn set_state(&self, id: ArtifactId, state: SyncState) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id, state);
        }
    }

    fn set_status(&self, id: ArtifactId, status: SyncStatus) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.entry(id).or_default().status = status;
        }
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot: BTreeMap<String, SyncState> = self
            .entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(id, state)| (id.to_string(), state.clone()))
            .collect();
        util::write_json_atomic(&self.root.join(STATE_FILE), &snapshot).await
    }

    /// Make the artifact's current durable content available locally.
    ///
    /// Returns the path of the cached content. Concurrent callers for the
    /// same artifact share one transfer.
    pub async fn ensure_local(&self, id: ArtifactId) -> Result<PathBuf> {
        let artifact = self.store.describe(id).await?;
        if self.is_fresh(&artifact).await {
            return Ok(self.content_path(&artifact));
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        // Another caller may have finished the transfer while we waited.
        let artifact = self.store.describe(id).await?;
        let path = self.content_path(&artifact);
        let state = self.sync_state(id);
        if state.is_current(artifact.version) {
            if tokio::fs::symlink_metadata(&path).await.is_ok() {
                return Ok(path);
            }
            tracing::warn!(artifact = %id.short(), "Cached content missing, marking corrupted");
            self.set_status(id, SyncStatus::Corrupted);
        }

        self.set_status(id, SyncStatus::Syncing);
        self.persist().await?;

        match self.transfer(&artifact).await {
            Ok(()) => {
                self.transfers.fetch_add(1, Ordering::SeqCst);
                self.set_state(
                    id,
                    SyncState {
                        status: SyncStatus::InSync,
                        synced_version: artifact.version,
                        last_synced: Some(Utc::now()),
                    },
                );
                self.persist().await?;
                tracing::debug!(
                    artifact = %id.short(),
                    version = artifact.version,
                    "Artifact synchronized"
                );
                Ok(path)
            }
            Err(e) => {
                self.set_status(id, SyncStatus::Stale);
                self.persist().await?;
                tracing::warn!(artifact = %id.short(), error = %e, "Artifact sync failed");
                Err(Error::Sync {
                    artifact: id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Fetch into a temp sibling of the slot, then swap it in.
    async fn transfer(&self, artifact: &Artifact) -> Result<()> {
        let slot = self.slot_dir(artifact.id);
        let tmp = util::temp_sibling(&slot, "sync");
        if let Err(e) = self.store.fetch(artifact.id, &tmp.join(&artifact.name)).await {
            let _ = blocking(move || util::remove_path(&tmp)).await;
            return Err(e);
        }
        swap_into(tmp, slot).await
    }

    /// Link (or copy) cached content into the task's working directory.
    ///
    /// Replaces whatever a previous attempt left at `target_name`. The cache
    /// copy itself is never modified.
    pub async fn stage_local_copy(
        &self,
        task: &ConcreteTask,
        artifact: ArtifactId,
        target_name: &str,
    ) -> Result<PathBuf> {
        let workdir = task.workdir.as_ref().ok_or_else(|| {
            Error::Validation(format!("Task {} has no working directory", task.id.short()))
        })?;
        let source = self.ensure_local(artifact).await?;
        let target = workdir.join(target_name);

        let stale = target.clone();
        blocking(move || util::remove_path(&stale)).await?;

        match self.link_mode {
            LinkMode::Symlink => link(&source, &target).await?,
            LinkMode::Copy => {
                let (src, dest) = (source.clone(), target.clone());
                blocking(move || util::copy_tree(&src, &dest)).await?;
            }
        }
        tracing::debug!(
            task = %task.id.short(),
            artifact = %artifact.short(),
            target = %target.display(),
            "Staged input"
        );
        Ok(target)
    }

    /// Publish task-local output into the durable store.
    ///
    /// The cache slot is refreshed from the same local bytes and marked
    /// InSync, so a following `ensure_local` transfers nothing.
    pub async fn destage(
        &self,
        task: &ConcreteTask,
        local_path: &Path,
        target: DestageTarget,
    ) -> Result<Artifact> {
        if let Some(store_id) = &task.results_store_id {
            if store_id != self.store.id() {
                return Err(Error::Validation(format!(
                    "Task {} targets unknown results store '{}'",
                    task.id.short(),
                    store_id
                )));
            }
        }

        let id = target.artifact_id();
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let artifact = self
            .store
            .publish(local_path, &target)
            .await
            .map_err(|e| Error::Sync {
                artifact: id,
                reason: e.to_string(),
            })?;

        let slot = self.slot_dir(id);
        let tmp = util::temp_sibling(&slot, "destage");
        let (src, dest) = (local_path.to_path_buf(), tmp.join(&artifact.name));
        let refreshed = match blocking(move || util::copy_tree(&src, &dest)).await {
            Ok(()) => swap_into(tmp, slot).await,
            Err(e) => {
                let _ = blocking(move || util::remove_path(&tmp)).await;
                Err(e)
            }
        };

        match refreshed {
            Ok(()) => self.set_state(
                id,
                SyncState {
                    status: SyncStatus::InSync,
                    synced_version: artifact.version,
                    last_synced: Some(Utc::now()),
                },
            ),
            Err(e) => {
                // The durable copy is complete; the slot just needs a refetch.
                tracing::warn!(artifact = %id.short(), error = %e, "Cache refresh after destage failed");
                self.set_status(id, SyncStatus::Stale);
            }
        }
        self.persist().await?;

        tracing::info!(
            task = %task.id.short(),
            artifact = %id.short(),
            name = %artifact.name,
            version = artifact.version,
            "Destaged output"
        );
        Ok(artifact)
    }

    /// File `child` under `parent` in the durable store, under the child's lock.
    pub async fn set_parent(&self, child: ArtifactId, parent: Option<ArtifactId>) -> Result<Artifact> {
        let lock = self.lock_for(child);
        let _guard = lock.lock().await;
        self.store.set_parent(child, parent).await
    }
}

async fn swap_into(tmp: PathBuf, slot: PathBuf) -> Result<()> {
    blocking(move || {
        util::remove_path(&slot)?;
        std::fs::rename(&tmp, &slot).inspect_err(|_| {
            let _ = util::remove_path(&tmp);
        })?;
        Ok(())
    })
    .await
}

#[cfg(unix)]
async fn link(source: &Path, target: &Path) -> Result<()> {
    tokio::fs::symlink(source, target).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn link(source: &Path, target: &Path) -> Result<()> {
    let (src, dest) = (source.to_path_buf(), target.to_path_buf());
    blocking(move || util::copy_tree(&src, &dest)).await
}
