//! Orchestrator: runs a plan stage by stage.
//!
//! Every group of a stage is spawned on the runtime and the stage is joined
//! before the next one starts. A failing group never aborts its siblings;
//! its unsuccessful tasks only block their dependents in later stages.

use crate::core::task::{Task, TaskId};
use crate::error::TaskError;
use crate::orchestration::collaborators::Collaborators;
use crate::orchestration::executor::{
    ExecutionEvent, ExecutorSettings, GroupExecutor, GroupResult, SkipReason, TaskExecution,
    TaskOutcome,
};
use crate::orchestration::planner::{ExecutionPlan, Group, GroupId, Stage};
use crate::orchestration::progress::{GroupStatus, ProgressStore, ProgressWriter};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTask {
    pub id: TaskId,
    pub attempts: u32,
    pub commit_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTask {
    pub id: TaskId,
    pub reason: TaskError,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTask {
    pub id: TaskId,
    pub reason: SkipReason,
    /// The dependency or sibling that prevented the task from starting.
    pub blocked_by: Option<TaskId>,
}

/// When a stage ran and how each of its groups ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimeline {
    pub stage: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub groups: BTreeMap<GroupId, GroupStatus>,
}

/// Outcome of a whole run. Every planned task appears in exactly one of
/// `completed`, `failed` or `skipped`, each listed in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub run_id: Uuid,
    pub completed: Vec<CompletedTask>,
    pub failed: Vec<FailedTask>,
    pub skipped: Vec<SkippedTask>,
    pub stage_timeline: Vec<StageTimeline>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip)]
    executions: Vec<TaskExecution>,
}

impl FinalReport {
    /// True when every task completed.
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.failed.len() + self.skipped.len()
    }

    /// Full execution record of a task, including its phase transitions.
    pub fn execution(&self, id: &TaskId) -> Option<&TaskExecution> {
        self.executions.iter().find(|e| &e.task.id == id)
    }

    pub fn executions(&self) -> &[TaskExecution] {
        &self.executions
    }

    pub fn is_completed(&self, id: &TaskId) -> bool {
        self.completed.iter().any(|c| &c.id == id)
    }

    pub fn failure(&self, id: &TaskId) -> Option<&FailedTask> {
        self.failed.iter().find(|f| &f.id == id)
    }

    pub fn skip(&self, id: &TaskId) -> Option<&SkippedTask> {
        self.skipped.iter().find(|s| &s.id == id)
    }
}

/// Drives an [`ExecutionPlan`] to completion.
///
/// # Example
///
/// ```ignore
/// let plan = stagewise::plan(tasks, 8)?;
/// let orchestrator = Orchestrator::new(collaborators, ExecutorSettings::default());
/// let report = orchestrator.execute(&plan, CancellationToken::new()).await;
/// assert!(report.success());
/// ```
pub struct Orchestrator {
    collaborators: Collaborators,
    settings: ExecutorSettings,
    progress: ProgressStore,
    event_tx: Option<mpsc::UnboundedSender<ExecutionEvent>>,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, settings: ExecutorSettings) -> Self {
        Self {
            collaborators,
            settings,
            progress: ProgressStore::new(),
            event_tx: None,
        }
    }

    /// Attach a channel that receives every [`ExecutionEvent`] of a run.
    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Handle to the live progress store, for polling.
    pub fn progress(&self) -> ProgressStore {
        self.progress.clone()
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Execute every stage of `plan` in order.
    ///
    /// Cancelling `cancel` interrupts in-flight tasks (they roll back) and
    /// stops dispatch of further stages.
    pub async fn execute(&self, plan: &ExecutionPlan, cancel: CancellationToken) -> FinalReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(
            run = %run_id,
            stages = plan.stages().len(),
            tasks = plan.task_count(),
            "run started"
        );

        let mut finished: HashMap<TaskId, TaskExecution> = HashMap::new();
        let mut blocked: HashSet<TaskId> = HashSet::new();
        let mut stage_timeline = Vec::new();

        for stage in plan.stages() {
            if cancel.is_cancelled() {
                tracing::warn!(stage = stage.index, "run cancelled, not dispatching stage");
                self.abandon_stage(plan, stage, &mut finished).await;
                continue;
            }

            let timeline = self
                .run_stage(plan, stage, &cancel, &mut finished, &blocked)
                .await;
            stage_timeline.push(timeline);

            blocked.extend(
                stage
                    .task_ids()
                    .filter(|id| !finished.get(*id).is_some_and(TaskExecution::is_completed))
                    .cloned(),
            );
        }

        let report = self.build_report(plan, run_id, started_at, finished, stage_timeline, &cancel);
        tracing::info!(
            run = %run_id,
            completed = report.completed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "run finished"
        );
        report
    }

    async fn run_stage(
        &self,
        plan: &ExecutionPlan,
        stage: &Stage,
        cancel: &CancellationToken,
        finished: &mut HashMap<TaskId, TaskExecution>,
        blocked: &HashSet<TaskId>,
    ) -> StageTimeline {
        let started_at = Utc::now();
        tracing::info!(stage = stage.index, groups = stage.groups.len(), "stage started");
        self.emit(ExecutionEvent::StageStarted {
            stage: stage.index,
            groups: stage.groups.len(),
        });

        let mut groups = BTreeMap::new();
        let mut handles = Vec::new();

        for group in &stage.groups {
            let writer = self
                .progress
                .writer(group.id.clone(), stage.index, group.len())
                .await;
            let mut runnable = Vec::new();

            for id in &group.task_ids {
                let Some(task) = plan.task(id).cloned() else {
                    continue;
                };
                let blocker = plan
                    .graph()
                    .dependencies(id)
                    .into_iter()
                    .find(|dep| blocked.contains(dep));
                match blocker {
                    Some(dependency) => {
                        let reason = SkipReason::DependencyFailed { dependency };
                        self.skip(&writer, task, reason, finished).await;
                    }
                    None => runnable.push(task),
                }
            }

            if runnable.is_empty() {
                writer.set_status(GroupStatus::Skipped).await;
                groups.insert(group.id.clone(), GroupStatus::Skipped);
                continue;
            }

            let subgroup = Group {
                task_ids: runnable.iter().map(|t| t.id.clone()).collect(),
                ..group.clone()
            };
            let mut executor = GroupExecutor::new(
                group.id.clone(),
                self.collaborators.clone(),
                self.settings,
                writer,
                cancel.clone(),
            );
            if let Some(tx) = &self.event_tx {
                executor = executor.with_events(tx.clone());
            }
            let fallback = runnable.clone();
            let handle = tokio::spawn(async move { executor.run(&subgroup, runnable).await });
            handles.push((group.id.clone(), fallback, handle));
        }

        let (meta, joins): (Vec<_>, Vec<_>) = handles
            .into_iter()
            .map(|(id, tasks, handle)| ((id, tasks), handle))
            .unzip();
        let results = join_all(joins).await;

        for ((group_id, tasks), joined) in meta.into_iter().zip(results) {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(group = %group_id, error = %e, "group task aborted");
                    self.aborted_group(group_id.clone(), tasks, e.to_string()).await
                }
            };
            groups.insert(result.group_id.clone(), result.status);
            for execution in result.executions {
                finished.insert(execution.task.id.clone(), execution);
            }
        }

        tracing::info!(stage = stage.index, "stage finished");
        self.emit(ExecutionEvent::StageFinished { stage: stage.index });
        StageTimeline {
            stage: stage.index,
            started_at,
            finished_at: Utc::now(),
            groups,
        }
    }

    /// Report every task of an undispatched stage as cancelled.
    async fn abandon_stage(
        &self,
        plan: &ExecutionPlan,
        stage: &Stage,
        finished: &mut HashMap<TaskId, TaskExecution>,
    ) {
        for group in &stage.groups {
            let writer = self
                .progress
                .writer(group.id.clone(), stage.index, group.len())
                .await;
            for id in &group.task_ids {
                if let Some(task) = plan.task(id).cloned() {
                    self.skip(&writer, task, SkipReason::Cancelled, finished).await;
                }
            }
            writer.set_status(GroupStatus::Cancelled).await;
        }
    }

    async fn skip(
        &self,
        writer: &ProgressWriter,
        task: Task,
        reason: SkipReason,
        finished: &mut HashMap<TaskId, TaskExecution>,
    ) {
        tracing::info!(task = %task.id, reason = %reason, "task skipped");
        writer.task_skipped().await;
        self.emit(ExecutionEvent::TaskSkipped {
            task_id: task.id.clone(),
            reason: reason.clone(),
        });
        finished.insert(task.id.clone(), TaskExecution::skipped(task, reason));
    }

    /// Result for a group whose runtime task panicked.
    async fn aborted_group(&self, group_id: GroupId, tasks: Vec<Task>, detail: String) -> GroupResult {
        let now = Utc::now();
        let executions = tasks
            .into_iter()
            .map(|mut task| {
                task.fail();
                TaskExecution {
                    task,
                    outcome: TaskOutcome::Failed {
                        error: TaskError::Aborted(detail.clone()),
                    },
                    transitions: Vec::new(),
                }
            })
            .collect();

        if let Some(mut record) = self.progress.get(&group_id).await {
            record.status = GroupStatus::Failed;
            record.phases.clear();
            record.last_update = now;
            self.progress.update(record).await;
        }

        GroupResult {
            group_id,
            status: GroupStatus::Failed,
            executions,
            started_at: now,
            finished_at: now,
        }
    }

    fn build_report(
        &self,
        plan: &ExecutionPlan,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        mut finished: HashMap<TaskId, TaskExecution>,
        stage_timeline: Vec<StageTimeline>,
        cancel: &CancellationToken,
    ) -> FinalReport {
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        let mut executions = Vec::with_capacity(plan.graph().len());

        for task in plan.graph().tasks() {
            let execution = finished
                .remove(&task.id)
                .unwrap_or_else(|| TaskExecution::skipped(task.clone(), SkipReason::Cancelled));
            let id = execution.task.id.clone();
            let attempts = execution.task.attempts;
            match &execution.outcome {
                TaskOutcome::Completed { commit_id } => completed.push(CompletedTask {
                    id,
                    attempts,
                    commit_id: commit_id.clone(),
                }),
                TaskOutcome::Failed { error } => failed.push(FailedTask {
                    id,
                    reason: error.clone(),
                    attempts,
                }),
                TaskOutcome::Skipped { reason } => skipped.push(SkippedTask {
                    id,
                    blocked_by: reason.blocked_by().cloned(),
                    reason: reason.clone(),
                }),
            }
            executions.push(execution);
        }

        FinalReport {
            run_id,
            completed,
            failed,
            skipped,
            stage_timeline,
            cancelled: cancel.is_cancelled(),
            started_at,
            finished_at: Utc::now(),
            executions,
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
