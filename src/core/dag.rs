//! Task graph store.
//!
//! Tasks and their dependencies form a directed acyclic graph backed by
//! petgraph. Edges point from a dependency to the task that needs it.
//! Dependencies may name tasks that have not been submitted yet; those
//! edges are parked until the missing task arrives, and the cycle check
//! runs against them at that point.

use chrono::{DateTime, Utc};
use petgraph::algo::{has_path_connecting, is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::core::lifecycle::{self, TaskEvent};
use crate::core::task::{Task, TaskId, TaskSpec, TaskStatus};
use crate::error::{Error, Result};

/// Aggregate status counts, recomputed on every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub not_started: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub completed: usize,
    pub abandoned: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.not_started + self.in_progress + self.blocked + self.completed + self.abandoned
    }
}

impl std::fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} completed, {} in progress, {} blocked, {} not started, {} abandoned",
            self.completed,
            self.total(),
            self.in_progress,
            self.blocked,
            self.not_started,
            self.abandoned
        )
    }
}

/// The task dependency graph and lifecycle store.
#[derive(Clone)]
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
    /// Missing dependency id -> tasks already waiting on it.
    parked: HashMap<TaskId, BTreeSet<TaskId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            parked: HashMap::new(),
        }
    }

    /// Insert a task as `NotStarted`.
    ///
    /// # Errors
    /// - `DuplicateTask` if the id is already present
    /// - `CycleDetected` if the new edges would close a cycle; the graph is
    ///   left exactly as it was
    pub fn add_task(&mut self, spec: TaskSpec, at: DateTime<Utc>) -> Result<TaskId> {
        let id = spec.id.clone();
        if self.task_index.contains_key(&id) {
            return Err(Error::DuplicateTask(id));
        }
        if spec.dependencies.contains(&id) {
            return Err(Error::CycleDetected {
                task: id.clone(),
                cycle_with: id,
            });
        }

        let missing: Vec<TaskId> = spec
            .dependencies
            .iter()
            .filter(|dep| !self.task_index.contains_key(*dep))
            .cloned()
            .collect();
        let waiting: Vec<TaskId> = self
            .parked
            .get(&id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let dep_indices: Vec<NodeIndex> = spec
            .dependencies
            .iter()
            .filter_map(|dep| self.task_index.get(dep).copied())
            .collect();

        // New node is always the last index, so removing it on rollback
        // leaves every other index untouched.
        let index = self.graph.add_node(Task::from_spec(spec, at));
        for dep in dep_indices {
            self.graph.add_edge(dep, index, ());
        }
        let mut waiting_indices = Vec::with_capacity(waiting.len());
        for dependent in &waiting {
            if let Some(&dep_index) = self.task_index.get(dependent) {
                self.graph.add_edge(index, dep_index, ());
                waiting_indices.push((dependent, dep_index));
            }
        }

        // The graph was acyclic before, so any cycle passes through the new
        // node via one of the parked edges.
        let closing = waiting_indices
            .iter()
            .find(|(_, dep_index)| has_path_connecting(&self.graph, *dep_index, index, None))
            .map(|(dependent, _)| (*dependent).clone());
        if let Some(cycle_with) = closing {
            self.graph.remove_node(index);
            return Err(Error::CycleDetected { task: id, cycle_with });
        }

        self.parked.remove(&id);
        for dep in missing {
            self.parked.entry(dep).or_default().insert(id.clone());
        }
        self.task_index.insert(id.clone(), index);
        Ok(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All tasks in submission order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Owned copy of every task in submission order.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks().cloned().collect()
    }

    /// True when every declared dependency exists and is `Completed`.
    pub fn dependencies_met(&self, id: &TaskId) -> bool {
        let Some(task) = self.get(id) else {
            return false;
        };
        task.dependencies.iter().all(|dep| {
            self.get(dep)
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Tasks that are `NotStarted` with every dependency `Completed`,
    /// in submission order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.tasks()
            .filter(|t| t.status == TaskStatus::NotStarted)
            .filter(|t| self.dependencies_met(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Apply a lifecycle event and return the updated task.
    ///
    /// # Errors
    /// `TaskNotFound` or `InvalidTransition`; on error the task is unchanged.
    pub fn transition(&mut self, id: &TaskId, event: &TaskEvent, at: DateTime<Utc>) -> Result<Task> {
        let deps_met = self.dependencies_met(id);
        let index = *self
            .task_index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let task = self
            .graph
            .node_weight_mut(index)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        lifecycle::apply(task, event, deps_met, at)?;
        Ok(task.clone())
    }

    /// Tasks that directly depend on `id`, including ones still parked.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .filter_map(|n| self.graph.node_weight(n))
                .map(|t| t.id.clone())
                .collect(),
            None => self
                .parked
                .get(id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Declared dependencies that have not been submitted yet.
    pub fn unresolved_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.get(id)
            .map(|t| {
                t.dependencies
                    .iter()
                    .filter(|dep| !self.contains(dep))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of in-progress tasks per assigned worker.
    pub fn load_by_worker(&self) -> HashMap<String, usize> {
        let mut load = HashMap::new();
        for task in self.tasks() {
            if task.status == TaskStatus::InProgress {
                if let Some(worker) = &task.assigned_worker {
                    *load.entry(worker.clone()).or_insert(0) += 1;
                }
            }
        }
        load
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.tasks() {
            match task.status {
                TaskStatus::NotStarted => counts.not_started += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Blocked { .. } => counts.blocked += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Abandoned { .. } => counts.abandoned += 1,
            }
        }
        counts
    }

    /// `(completed, total)`, where abandoned tasks count toward neither.
    pub fn progress(&self) -> (usize, usize) {
        let counts = self.status_counts();
        (counts.completed, counts.total() - counts.abandoned)
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }

    /// Tasks ordered so each comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id.clone())
                .unwrap_or_else(|| TaskId::from("unknown"));
            Error::CycleDetected {
                task: id.clone(),
                cycle_with: id,
            }
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .map(|t| t.id.clone())
            .collect())
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .field("parked", &self.parked.len())
            .finish()
    }
}
