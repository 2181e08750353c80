//! Prerequisite graph between concrete tasks.
//!
//! Edges point from a prerequisite to the task waiting on it. The graph only
//! stores ids; task records live in the state store and are re-read on every
//! step, so the graph never holds stale copies.

use crate::core::task::{ConcreteTask, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

pub struct TaskDAG {
    graph: DiGraph<TaskId, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build the graph for a set of tasks from their `prerequisites`.
    ///
    /// Prerequisites outside the set are ignored here; the state machine
    /// still checks them against the store before a task leaves New.
    pub fn from_tasks(tasks: &[ConcreteTask]) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            dag.add_task(task.id);
        }
        for task in tasks {
            for prereq in &task.prerequisites {
                if dag.contains_task(prereq) {
                    dag.add_prerequisite(prereq, &task.id)?;
                }
            }
        }
        Ok(dag)
    }

    /// Add a task node. Adding an existing id returns its index.
    pub fn add_task(&mut self, id: TaskId) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&id) {
            return index;
        }
        let index = self.graph.add_node(id);
        self.task_index.insert(id, index);
        index
    }

    /// Record that `dependent` waits on `prerequisite`.
    ///
    /// # Errors
    /// Fails if either task is unknown or the edge would create a cycle.
    pub fn add_prerequisite(&mut self, prerequisite: &TaskId, dependent: &TaskId) -> Result<()> {
        let from = self.node(prerequisite)?;
        let to = self.node(dependent)?;

        if self.graph.find_edge(from, to).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from, to, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "Prerequisite {} -> {} would create a cycle",
                prerequisite.short(),
                dependent.short()
            )));
        }
        Ok(())
    }

    fn node(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", id)))
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.graph.node_weights().copied().collect()
    }

    pub fn prerequisites_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n).copied())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task that transitively waits on `id`.
    pub fn downstream_of(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut out = Vec::new();
        while let Some(index) = dfs.next(&self.graph) {
            if index != start {
                if let Some(task) = self.graph.node_weight(index) {
                    out.push(*task);
                }
            }
        }
        out
    }

    // ========== Scheduling Operations ==========

    /// Tasks not yet finished whose prerequisites are all completed.
    ///
    /// `finished` holds tasks that need no more scheduling (completed or
    /// failed); only `completed` ones satisfy a prerequisite.
    pub fn ready_tasks(
        &self,
        completed: &HashSet<TaskId>,
        finished: &HashSet<TaskId>,
    ) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let id = *self.graph.node_weight(index)?;
                if finished.contains(&id) || completed.contains(&id) {
                    return None;
                }
                let satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(|dep_id| completed.contains(dep_id))
                            .unwrap_or(false)
                    });
                satisfied.then_some(id)
            })
            .collect()
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
