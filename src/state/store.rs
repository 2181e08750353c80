//! JSON persistence for requests, tasks and the provenance ledger.
//!
//! Layout under the state directory:
//!
//! ```text
//! requests/<id>.json
//! tasks/<id>.json
//! provenance/records/<record-id>.json
//! provenance/parents/<child-id>.json
//! ```
//!
//! Every write goes to a temporary sibling and is renamed into place, so a
//! crash never leaves a half-written record. Derivation records are only
//! ever added, one file each, so processes sharing the directory never
//! overwrite each other's provenance. Ledgers written by older releases as
//! a single `provenance.json` are still read.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::core::{ConcreteTask, RequestId, TaskId, TaskRequest};
use crate::provenance::{DerivationRecord, LedgerChange, LedgerSnapshot, ParentLink, ProvenanceLedger};
use crate::state::migration;
use crate::util::write_json_atomic;
use crate::{Error, Result};

const RECORDS_DIR: &str = "provenance/records";
const PARENTS_DIR: &str = "provenance/parents";
const LEGACY_LEDGER: &str = "provenance.json";

pub struct StateStore {
    root: PathBuf,
    ledger_lock: Mutex<()>,
}

impl StateStore {
    pub async fn open(root: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(root.join("requests")).await?;
        tokio::fs::create_dir_all(root.join("tasks")).await?;
        tokio::fs::create_dir_all(root.join(RECORDS_DIR)).await?;
        tokio::fs::create_dir_all(root.join(PARENTS_DIR)).await?;
        Ok(Self {
            root: root.to_path_buf(),
            ledger_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn request_path(&self, id: RequestId) -> PathBuf {
        self.root.join("requests").join(format!("{}.json", id))
    }

    fn task_path(&self, id: TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{}.json", id))
    }

    fn ledger_entry_path(&self, dir: &str, id: impl std::fmt::Display) -> PathBuf {
        self.root.join(dir).join(format!("{}.json", id))
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_request(&self, request: &TaskRequest) -> Result<()> {
        write_json_atomic(&self.request_path(request.id), request).await
    }

    pub async fn load_request(&self, id: RequestId) -> Result<TaskRequest> {
        Self::read_json(&self.request_path(id))
            .await?
            .ok_or(Error::RequestNotFound(id))
    }

    pub async fn save_task(&self, task: &ConcreteTask) -> Result<()> {
        write_json_atomic(&self.task_path(task.id), task).await
    }

    /// Load a task, upgrading and rewriting records from older schemas.
    pub async fn load_task(&self, id: TaskId) -> Result<ConcreteTask> {
        let path = self.task_path(id);
        let raw: Value = Self::read_json(&path).await?.ok_or(Error::TaskNotFound(id))?;
        let (value, upgraded) = migration::upgrade_task(raw)?;
        let task: ConcreteTask = serde_json::from_value(value)?;
        if upgraded {
            self.save_task(&task).await?;
            tracing::info!(task = %id.short(), "Migrated task record to current schema");
        }
        Ok(task)
    }

    async fn list_ids<T: std::str::FromStr>(&self, dir: &str) -> Result<Vec<T>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(dir)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(id) = stem.parse() {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub async fn list_requests(&self) -> Result<Vec<TaskRequest>> {
        let mut requests = Vec::new();
        for id in self.list_ids::<RequestId>("requests").await? {
            requests.push(self.load_request(id).await?);
        }
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    /// All tasks, oldest first.
    pub async fn list_tasks(&self) -> Result<Vec<ConcreteTask>> {
        let mut tasks = Vec::new();
        for id in self.list_ids::<TaskId>("tasks").await? {
            tasks.push(self.load_task(id).await?);
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    pub async fn tasks_for_request(&self, request: RequestId) -> Result<Vec<ConcreteTask>> {
        let mut tasks = self.list_tasks().await?;
        tasks.retain(|t| t.request_id == request);
        Ok(tasks)
    }

    async fn read_dir_json<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(dir)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Removed between listing and reading.
            if let Some(item) = Self::read_json(&path).await? {
                items.push(item);
            }
        }
        Ok(items)
    }

    pub async fn load_ledger(&self) -> Result<ProvenanceLedger> {
        let legacy: LedgerSnapshot = Self::read_json(&self.root.join(LEGACY_LEDGER))
            .await?
            .unwrap_or_default();

        let mut records: Vec<DerivationRecord> = self.read_dir_json(RECORDS_DIR).await?;
        for record in legacy.records {
            if !records.iter().any(|r| r.id == record.id) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut parents: Vec<ParentLink> = self.read_dir_json(PARENTS_DIR).await?;
        for link in legacy.parents {
            if !parents.iter().any(|p| p.child == link.child) {
                parents.push(link);
            }
        }

        tracing::debug!(
            records = records.len(),
            parents = parents.len(),
            "Loaded provenance ledger"
        );
        Ok(ProvenanceLedger::from_snapshot(LedgerSnapshot { records, parents }))
    }

    /// Write the ledger's unsaved changes, one file per change.
    ///
    /// Changes that fail to write stay queued for the next save.
    pub async fn save_ledger(&self, ledger: &ProvenanceLedger) -> Result<()> {
        let _guard = self.ledger_lock.lock().await;
        let mut pending = ledger.take_pending().into_iter();
        while let Some(change) = pending.next() {
            let written = match &change {
                LedgerChange::Record(record) => {
                    write_json_atomic(&self.ledger_entry_path(RECORDS_DIR, record.id), record).await
                }
                LedgerChange::Parent(link) => {
                    write_json_atomic(&self.ledger_entry_path(PARENTS_DIR, link.child), link).await
                }
            };
            if let Err(e) = written {
                let mut unsaved = vec![change];
                unsaved.extend(pending);
                ledger.restore_pending(unsaved);
                return Err(e);
            }
        }
        Ok(())
    }
}
