//! Task dependency graph.
//!
//! `TaskGraph` merges the explicit dependencies declared on each task with
//! resource-conflict edges synthesized from the order in which tasks touch
//! shared resources. The merged graph is checked for cycles before any
//! scheduling happens and is immutable afterwards.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Why one task must finish before another starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DependencyKind {
    /// Declared by the plan author.
    Explicit,
    /// Both tasks mutate `resource`; the earlier writer goes first.
    ResourceConflict { resource: String },
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Explicit => write!(f, "explicit"),
            DependencyKind::ResourceConflict { resource } => {
                write!(f, "resource: {}", resource)
            }
        }
    }
}

/// A derived `from -> to` edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: TaskId,
    pub to: TaskId,
    pub kind: DependencyKind,
}

/// The merged, acyclic task dependency graph.
pub struct TaskGraph {
    graph: DiGraph<Task, DependencyKind>,
    task_index: HashMap<TaskId, NodeIndex>,
    /// Node indices in input order; input order is the planner's tie-break.
    order: Vec<NodeIndex>,
}

impl TaskGraph {
    /// Build the graph from tasks in input order.
    ///
    /// # Errors
    /// - `Validation` for an empty task id
    /// - `DuplicateTask` when two tasks share an id
    /// - `UnknownDependency` when a task depends on an id not in `tasks`
    /// - `Cycle` when explicit and resource edges combine into a cycle
    pub fn build(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();
        let mut order = Vec::with_capacity(tasks.len());

        for task in tasks {
            if task.id.as_str().trim().is_empty() {
                return Err(Error::Validation("task id must not be empty".to_string()));
            }
            if task_index.contains_key(&task.id) {
                return Err(Error::DuplicateTask(task.id));
            }
            let id = task.id.clone();
            let index = graph.add_node(task);
            task_index.insert(id, index);
            order.push(index);
        }

        let mut dag = Self {
            graph,
            task_index,
            order,
        };
        dag.add_explicit_edges()?;
        dag.add_resource_edges();

        if let Some(path) = dag.find_cycle() {
            let task = path[0].clone();
            tracing::warn!(task = %task, "dependency cycle rejected");
            return Err(Error::Cycle { task, path });
        }

        tracing::debug!(
            tasks = dag.len(),
            edges = dag.graph.edge_count(),
            "task graph built"
        );
        Ok(dag)
    }

    fn add_explicit_edges(&mut self) -> Result<()> {
        for &index in &self.order.clone() {
            let task = &self.graph[index];
            let task_id = task.id.clone();
            let deps = task.dependencies.clone();
            for dep in deps {
                let from = *self.task_index.get(&dep).ok_or_else(|| Error::UnknownDependency {
                    task: task_id.clone(),
                    dependency: dep.clone(),
                })?;
                if self.graph.find_edge(from, index).is_none() {
                    self.graph.add_edge(from, index, DependencyKind::Explicit);
                }
            }
        }
        Ok(())
    }

    /// Last writer of a resource must finish before the next writer starts.
    fn add_resource_edges(&mut self) {
        let mut last_writer: HashMap<String, NodeIndex> = HashMap::new();
        for &index in &self.order.clone() {
            let resources = self.graph[index].resource_touches.clone();
            for resource in resources {
                if let Some(&previous) = last_writer.get(&resource) {
                    if previous != index && self.graph.find_edge(previous, index).is_none() {
                        self.graph.add_edge(
                            previous,
                            index,
                            DependencyKind::ResourceConflict {
                                resource: resource.clone(),
                            },
                        );
                    }
                }
                last_writer.insert(resource, index);
            }
        }
    }

    /// Three-colour DFS over the merged edges.
    ///
    /// Returns the first cycle found, walking roots and successors in input
    /// order, as the list of task ids along the cycle with the first id
    /// repeated at the end.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color = vec![Color::White; self.graph.node_count()];

        for &root in &self.order {
            if color[root.index()] != Color::White {
                continue;
            }
            color[root.index()] = Color::Gray;
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> =
                vec![(root, self.sorted_successors(root), 0)];

            while let Some(top) = stack.last_mut() {
                if top.2 == top.1.len() {
                    let finished = top.0;
                    color[finished.index()] = Color::Black;
                    stack.pop();
                    continue;
                }
                let next = top.1[top.2];
                top.2 += 1;

                match color[next.index()] {
                    Color::White => {
                        color[next.index()] = Color::Gray;
                        let succ = self.sorted_successors(next);
                        stack.push((next, succ, 0));
                    }
                    Color::Gray => {
                        let start = stack
                            .iter()
                            .position(|(n, _, _)| *n == next)
                            .unwrap_or(0);
                        let mut path: Vec<TaskId> = stack[start..]
                            .iter()
                            .map(|(n, _, _)| self.graph[*n].id.clone())
                            .collect();
                        path.push(self.graph[next].id.clone());
                        return Some(path);
                    }
                    Color::Black => {}
                }
            }
        }
        None
    }

    fn sorted_successors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut succ: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        succ.sort();
        succ.dedup();
        succ
    }

    fn sorted_predecessors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut preds: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .collect();
        preds.sort();
        preds.dedup();
        preds
    }

    /// Tasks not in `completed` whose dependencies are all in `completed`,
    /// in input order.
    pub fn topo_ready(&self, completed: &HashSet<TaskId>) -> Vec<TaskId> {
        self.order
            .iter()
            .filter_map(|&index| {
                let task = &self.graph[index];
                if completed.contains(&task.id) {
                    return None;
                }
                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| completed.contains(&self.graph[dep].id));
                deps_satisfied.then(|| task.id.clone())
            })
            .collect()
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index.get(id).map(|&index| &self.graph[index])
    }

    /// All tasks in input order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().map(move |&index| &self.graph[index])
    }

    /// Direct dependencies of `id` (explicit and resource), in input order.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .sorted_predecessors(index)
                .into_iter()
                .map(|dep| self.graph[dep].id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Tasks that directly depend on `id`, in input order.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .sorted_successors(index)
                .into_iter()
                .map(|dep| self.graph[dep].id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn dependency_kind(&self, from: &TaskId, to: &TaskId) -> Option<&DependencyKind> {
        let from = self.task_index.get(from)?;
        let to = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*from, *to)?;
        self.graph.edge_weight(edge)
    }

    /// Every edge, ordered by (from, to) input position.
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<(NodeIndex, NodeIndex, DependencyEdge)> = self
            .graph
            .edge_references()
            .map(|edge| {
                (
                    edge.source(),
                    edge.target(),
                    DependencyEdge {
                        from: self.graph[edge.source()].id.clone(),
                        to: self.graph[edge.target()].id.clone(),
                        kind: edge.weight().clone(),
                    },
                )
            })
            .collect();
        edges.sort_by_key(|(from, to, _)| (*from, *to));
        edges.into_iter().map(|(_, _, edge)| edge).collect()
    }

    /// Position of `id` in the input order.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.task_index.get(id).map(|index| index.index())
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
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
