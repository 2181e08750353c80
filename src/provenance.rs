//! Provenance ledger: which outputs were derived from which inputs.
//!
//! Derivation records are immutable and attributed to a task and run
//! number. The ledger also keeps the navigational parent/child hierarchy
//! outputs are filed under.
//!
//! Changes made since the last save are queued as [`LedgerChange`]s so the
//! state store can persist them one file each. Nothing already on disk is
//! rewritten, so several processes can share one state directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::core::{define_id, ArtifactId, ConcreteTask, TaskId};
use crate::{Error, Result};

define_id!(
    /// Unique identifier for a derivation record.
    RecordId
);

/// Immutable edge set: these inputs produced these outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationRecord {
    pub id: RecordId,
    pub task_id: TaskId,
    pub run_number: u32,
    pub operation: String,
    pub inputs: Vec<ArtifactId>,
    pub outputs: Vec<ArtifactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub child: ArtifactId,
    pub parent: ArtifactId,
}

/// Serializable form of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub records: Vec<DerivationRecord>,
    #[serde(default)]
    pub parents: Vec<ParentLink>,
}

/// A change not yet written to disk.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerChange {
    Record(DerivationRecord),
    Parent(ParentLink),
}

#[derive(Debug, Default)]
struct LedgerState {
    records: Vec<DerivationRecord>,
    parents: HashMap<ArtifactId, ArtifactId>,
    pending: Vec<LedgerChange>,
}

#[derive(Debug, Default)]
pub struct ProvenanceLedger {
    state: RwLock<LedgerState>,
}

impl ProvenanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let parents = snapshot
            .parents
            .into_iter()
            .map(|link| (link.child, link.parent))
            .collect();
        Self {
            state: RwLock::new(LedgerState {
                records: snapshot.records,
                parents,
                pending: Vec::new(),
            }),
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.read();
        let mut parents: Vec<ParentLink> = state
            .parents
            .iter()
            .map(|(child, parent)| ParentLink {
                child: *child,
                parent: *parent,
            })
            .collect();
        parents.sort_by_key(|link| link.child);
        LedgerSnapshot {
            records: state.records.clone(),
            parents,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Take the changes made since the last call.
    pub fn take_pending(&self) -> Vec<LedgerChange> {
        std::mem::take(&mut self.write().pending)
    }

    /// Put back changes that could not be written, ahead of newer ones.
    pub fn restore_pending(&self, mut changes: Vec<LedgerChange>) {
        let mut state = self.write();
        changes.append(&mut state.pending);
        state.pending = changes;
    }

    pub fn has_pending(&self) -> bool {
        !self.read().pending.is_empty()
    }

    /// Record that `task`'s current run derived `outputs` from `inputs`.
    ///
    /// Recording the same outputs for the same run again returns the
    /// existing record.
    pub fn record(
        &self,
        task: &ConcreteTask,
        inputs: &[ArtifactId],
        outputs: &[ArtifactId],
        note: Option<&str>,
    ) -> Result<DerivationRecord> {
        if outputs.is_empty() {
            return Err(Error::Validation(format!(
                "Derivation record for task {} has no outputs",
                task.id.short()
            )));
        }
        let mut state = self.write();
        if let Some(existing) = state.records.iter().find(|r| {
            r.task_id == task.id && r.run_number == task.run_number && r.outputs == outputs
        }) {
            tracing::debug!(
                task = %task.id.short(),
                run = task.run_number,
                "Derivation already recorded"
            );
            return Ok(existing.clone());
        }
        let record = DerivationRecord {
            id: RecordId::new(),
            task_id: task.id,
            run_number: task.run_number,
            operation: task.operation.clone(),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            note: note.map(str::to_string),
            created_at: Utc::now(),
        };
        state.records.push(record.clone());
        state.pending.push(LedgerChange::Record(record.clone()));
        drop(state);
        tracing::info!(
            task = %task.id.short(),
            run = task.run_number,
            inputs = inputs.len(),
            outputs = outputs.len(),
            "Recorded derivation"
        );
        Ok(record)
    }

    /// File `child` under `parent`. Re-attaching moves the child.
    pub fn attach(&self, child: ArtifactId, parent: ArtifactId) -> Result<()> {
        let mut state = self.write();
        if child == parent || ancestors_in(&state.parents, parent).contains(&child) {
            return Err(Error::Validation(format!(
                "Attaching {} under {} would create a cycle",
                child.short(),
                parent.short()
            )));
        }
        state.parents.insert(child, parent);
        state
            .pending
            .push(LedgerChange::Parent(ParentLink { child, parent }));
        Ok(())
    }

    pub fn parent_of(&self, child: ArtifactId) -> Option<ArtifactId> {
        self.read().parents.get(&child).copied()
    }

    pub fn children_of(&self, parent: ArtifactId) -> Vec<ArtifactId> {
        let mut children: Vec<ArtifactId> = self
            .read()
            .parents
            .iter()
            .filter(|(_, p)| **p == parent)
            .map(|(c, _)| *c)
            .collect();
        children.sort();
        children
    }

    /// Parent chain from the immediate parent up to the root.
    pub fn ancestors(&self, id: ArtifactId) -> Vec<ArtifactId> {
        ancestors_in(&self.read().parents, id)
    }

    /// Records that list `output` among their outputs.
    pub fn derivations_of(&self, output: ArtifactId) -> Vec<DerivationRecord> {
        self.read()
            .records
            .iter()
            .filter(|r| r.outputs.contains(&output))
            .cloned()
            .collect()
    }

    /// Everything derived, directly or transitively, from `input`.
    pub fn derived_from(&self, input: ArtifactId) -> Vec<ArtifactId> {
        let state = self.read();
        let mut seen = HashSet::new();
        let mut frontier = vec![input];
        let mut out = Vec::new();
        while let Some(current) = frontier.pop() {
            for record in state.records.iter().filter(|r| r.inputs.contains(&current)) {
                for output in &record.outputs {
                    if seen.insert(*output) {
                        out.push(*output);
                        frontier.push(*output);
                    }
                }
            }
        }
        out
    }

    pub fn records_for_task(&self, task: TaskId) -> Vec<DerivationRecord> {
        self.read()
            .records
            .iter()
            .filter(|r| r.task_id == task)
            .cloned()
            .collect()
    }

    pub fn has_record_for(&self, task: TaskId, run_number: u32) -> bool {
        self.read()
            .records
            .iter()
            .any(|r| r.task_id == task && r.run_number == run_number)
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn ancestors_in(parents: &HashMap<ArtifactId, ArtifactId>, id: ArtifactId) -> Vec<ArtifactId> {
    let mut out = Vec::new();
    let mut current = id;
    while let Some(parent) = parents.get(&current) {
        if out.contains(parent) {
            break;
        }
        out.push(*parent);
        current = *parent;
    }
    out
}
