//! Batch planner: turns a task graph into ordered stages of groups.
//!
//! Each stage holds the tasks unlocked by everything planned before it,
//! packed first-fit into groups under a workload budget. Stages run
//! strictly in order; the groups of one stage run concurrently.

use crate::core::cost::{ComplexityCost, CostModel};
use crate::core::dag::{DependencyEdge, TaskGraph};
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Default workload budget per group.
pub const DEFAULT_MAX_BATCH_COST: u32 = 8;

/// Deterministic group identifier, `stage-{n}/group-{m}` (1-based).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(stage: usize, group: usize) -> Self {
        Self(format!("stage-{}/group-{}", stage, group))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a group's own tasks are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Parallel => write!(f, "parallel"),
            ExecutionMode::Sequential => write!(f, "sequential"),
        }
    }
}

/// Tasks batched to execute together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub task_ids: Vec<TaskId>,
    /// Sum of the member tasks' weights.
    pub cost: u32,
    pub mode: ExecutionMode,
}

impl Group {
    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_ids.contains(id)
    }
}

/// A synchronization barrier: all groups run, then all must finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// 1-based position in the plan.
    pub index: usize,
    pub groups: Vec<Group>,
}

impl Stage {
    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.groups.iter().flat_map(|g| g.task_ids.iter())
    }

    pub fn task_count(&self) -> usize {
        self.groups.iter().map(Group::len).sum()
    }
}

/// Output of planning: the immutable graph plus its stages.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    graph: Arc<TaskGraph>,
    stages: Vec<Stage>,
    max_batch_cost: u32,
}

impl ExecutionPlan {
    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn max_batch_cost(&self) -> u32 {
        self.max_batch_cost
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(Stage::task_count).sum()
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.graph.task(id)
    }

    /// Stage index and group id holding `id`.
    pub fn locate(&self, id: &TaskId) -> Option<(usize, &GroupId)> {
        self.stages.iter().find_map(|stage| {
            stage
                .groups
                .iter()
                .find(|g| g.contains(id))
                .map(|g| (stage.index, &g.id))
        })
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            max_batch_cost: self.max_batch_cost,
            task_count: self.task_count(),
            stages: self.stages.clone(),
            edges: self.graph.edges(),
        }
    }
}

/// Serializable view of a plan for external consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub max_batch_cost: u32,
    pub task_count: usize,
    pub stages: Vec<Stage>,
    pub edges: Vec<DependencyEdge>,
}

/// Packs a task graph into stages and groups.
///
/// # Example
///
/// ```ignore
/// use stagewise::core::{ComplexityCost, Task, TaskGraph};
/// use stagewise::orchestration::BatchPlanner;
///
/// let graph = TaskGraph::build(vec![Task::new("a", "A"), Task::new("b", "B").depends_on("a")])?;
/// let plan = BatchPlanner::new(ComplexityCost, 8)?.plan(graph)?;
/// assert_eq!(plan.stages().len(), 2);
/// ```
pub struct BatchPlanner<C: CostModel = ComplexityCost> {
    cost_model: C,
    max_batch_cost: u32,
}

impl Default for BatchPlanner<ComplexityCost> {
    fn default() -> Self {
        Self {
            cost_model: ComplexityCost,
            max_batch_cost: DEFAULT_MAX_BATCH_COST,
        }
    }
}

impl<C: CostModel> BatchPlanner<C> {
    /// # Errors
    /// Returns `Validation` when `max_batch_cost` is zero.
    pub fn new(cost_model: C, max_batch_cost: u32) -> Result<Self> {
        if max_batch_cost == 0 {
            return Err(Error::Validation(
                "max_batch_cost must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            cost_model,
            max_batch_cost,
        })
    }

    pub fn max_batch_cost(&self) -> u32 {
        self.max_batch_cost
    }

    /// Plan the graph into stages.
    ///
    /// Deterministic for a fixed graph: ready tasks are taken in input
    /// order and placed first-fit.
    pub fn plan(&self, graph: impl Into<Arc<TaskGraph>>) -> Result<ExecutionPlan> {
        let graph = graph.into();
        let mut completed: HashSet<TaskId> = HashSet::new();
        let mut stages = Vec::new();
        let mut ready = graph.topo_ready(&completed);

        while !ready.is_empty() {
            let index = stages.len() + 1;
            let stage = self.pack_stage(&graph, index, &ready);
            tracing::debug!(
                stage = index,
                groups = stage.groups.len(),
                tasks = stage.task_count(),
                "stage planned"
            );
            completed.extend(ready.drain(..));
            stages.push(stage);
            ready = graph.topo_ready(&completed);
        }

        if completed.len() < graph.len() {
            // TaskGraph::build rejects cycles, so this only trips on a graph
            // whose edges changed underneath it.
            let path = graph.find_cycle().unwrap_or_default();
            let task = path.first().cloned().or_else(|| {
                graph
                    .tasks()
                    .find(|t| !completed.contains(&t.id))
                    .map(|t| t.id.clone())
            });
            if let Some(task) = task {
                return Err(Error::Cycle { task, path });
            }
        }

        tracing::info!(
            stages = stages.len(),
            tasks = graph.len(),
            budget = self.max_batch_cost,
            "plan ready"
        );
        Ok(ExecutionPlan {
            graph,
            stages,
            max_batch_cost: self.max_batch_cost,
        })
    }

    fn pack_stage(&self, graph: &TaskGraph, index: usize, ready: &[TaskId]) -> Stage {
        let mut bins: Vec<(Vec<TaskId>, u32)> = Vec::new();

        for id in ready {
            let weight = graph
                .task(id)
                .map(|task| self.cost_model.weight(task))
                .unwrap_or(0);
            match bins
                .iter_mut()
                .find(|(_, cost)| {
                    cost.checked_add(weight)
                        .is_some_and(|total| total <= self.max_batch_cost)
                })
            {
                Some((members, cost)) => {
                    members.push(id.clone());
                    *cost += weight;
                }
                // Also covers a task heavier than the whole budget.
                None => bins.push((vec![id.clone()], weight)),
            }
        }

        let mode = if bins.len() == 1 && bins[0].0.len() == 1 {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Parallel
        };

        let groups = bins
            .into_iter()
            .enumerate()
            .map(|(i, (task_ids, cost))| Group {
                id: GroupId::new(index, i + 1),
                task_ids,
                cost,
                mode,
            })
            .collect();

        Stage { index, groups }
    }
}

/// Build the graph and plan it with the default cost model.
pub fn plan(tasks: Vec<Task>, max_batch_cost: u32) -> Result<ExecutionPlan> {
    let graph = TaskGraph::build(tasks)?;
    BatchPlanner::new(ComplexityCost, max_batch_cost)?.plan(graph)
}
