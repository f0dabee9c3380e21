//! Group executor: drives each task of one group through its state machine.
//!
//! ```text
//! Analyzing -> Mutating -> Verifying -> Committing -> Completed
//! Verifying -(fail)-> RollingBack -> Analyzing   [attempts < max_iterations]
//! Verifying -(fail)-> RollingBack -> Failed       [attempts == max_iterations]
//! ```
//!
//! Mutation and commit failures also go through RollingBack and share the
//! same `attempts` counter. An analysis failure fails the task at once. A
//! failed revert fails the task and halts the group, since the state of
//! its resources is no longer known.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result, TaskError};
use crate::orchestration::collaborators::Collaborators;
use crate::orchestration::planner::{ExecutionMode, Group, GroupId};
use crate::orchestration::progress::{GroupStatus, ProgressWriter};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default number of rollbacks a task may go through before it fails.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Phase of a task inside the executor's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Analyzing,
    Mutating,
    Verifying,
    Committing,
    RollingBack,
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPhase::Analyzing => write!(f, "analyzing"),
            TaskPhase::Mutating => write!(f, "mutating"),
            TaskPhase::Verifying => write!(f, "verifying"),
            TaskPhase::Committing => write!(f, "committing"),
            TaskPhase::RollingBack => write!(f, "rolling_back"),
        }
    }
}

/// A phase entry with the attempt it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: TaskPhase,
    /// Rollbacks completed before this phase was entered.
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Why a task never started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// A dependency failed or was itself skipped.
    DependencyFailed { dependency: TaskId },
    /// A sibling's rollback failed and the group stopped.
    GroupHalted { by: TaskId },
    /// The run was cancelled first.
    Cancelled,
}

impl SkipReason {
    /// Task that blocked this one, if any.
    pub fn blocked_by(&self) -> Option<&TaskId> {
        match self {
            SkipReason::DependencyFailed { dependency } => Some(dependency),
            SkipReason::GroupHalted { by } => Some(by),
            SkipReason::Cancelled => None,
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::DependencyFailed { dependency } => {
                write!(f, "dependency {} did not complete", dependency)
            }
            SkipReason::GroupHalted { by } => write!(f, "group halted by {}", by),
            SkipReason::Cancelled => write!(f, "run cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    Completed { commit_id: String },
    Failed { error: TaskError },
    Skipped { reason: SkipReason },
}

/// Final state of one task after its group ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task: Task,
    pub outcome: TaskOutcome,
    pub transitions: Vec<PhaseTransition>,
}

impl TaskExecution {
    pub fn skipped(mut task: Task, reason: SkipReason) -> Self {
        task.fail();
        Self {
            task,
            outcome: TaskOutcome::Skipped { reason },
            transitions: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Completed { .. })
    }

    pub fn rollbacks(&self) -> usize {
        self.transitions_to(TaskPhase::RollingBack)
    }

    pub fn transitions_to(&self, phase: TaskPhase) -> usize {
        self.transitions.iter().filter(|t| t.phase == phase).count()
    }

    /// When the task first entered `phase`.
    pub fn first_entered(&self, phase: TaskPhase) -> Option<DateTime<Utc>> {
        self.transitions
            .iter()
            .find(|t| t.phase == phase)
            .map(|t| t.at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupResult {
    pub group_id: GroupId,
    pub status: GroupStatus,
    /// One entry per task, in group order.
    pub executions: Vec<TaskExecution>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Events emitted while a run progresses.
///
/// These let external components react to state changes without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    StageStarted { stage: usize, groups: usize },
    GroupStarted { group_id: GroupId },
    PhaseEntered {
        group_id: GroupId,
        task_id: TaskId,
        phase: TaskPhase,
        attempt: u32,
    },
    TaskCompleted { task_id: TaskId, commit_id: String },
    TaskFailed { task_id: TaskId, error: TaskError },
    TaskSkipped { task_id: TaskId, reason: SkipReason },
    GroupFinished { group_id: GroupId, status: GroupStatus },
    StageFinished { stage: usize },
}

/// Knobs shared by every group of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub max_iterations: u32,
    /// Per collaborator call; expiry counts as a collaborator error.
    pub collaborator_timeout: Option<Duration>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            collaborator_timeout: None,
        }
    }
}

/// Result of a collaborator call raced against the halt signal.
enum Step<T> {
    Done(Result<T>),
    Interrupted,
}

/// Runs a single group.
pub struct GroupExecutor {
    group_id: GroupId,
    collaborators: Collaborators,
    settings: ExecutorSettings,
    progress: ProgressWriter,
    /// Run-wide cancellation.
    cancel: CancellationToken,
    /// Child of `cancel`; also fired when a rollback fails in this group.
    halt: CancellationToken,
    halted_by: OnceLock<TaskId>,
    event_tx: Option<mpsc::UnboundedSender<ExecutionEvent>>,
}

impl GroupExecutor {
    pub fn new(
        group_id: GroupId,
        collaborators: Collaborators,
        settings: ExecutorSettings,
        progress: ProgressWriter,
        cancel: CancellationToken,
    ) -> Self {
        let halt = cancel.child_token();
        Self {
            group_id,
            collaborators,
            settings,
            progress,
            cancel,
            halt,
            halted_by: OnceLock::new(),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Run `tasks` (the group's members, in group order).
    pub async fn run(self, group: &Group, tasks: Vec<Task>) -> GroupResult {
        let started_at = Utc::now();
        tracing::info!(group = %group.id, tasks = tasks.len(), mode = %group.mode, "group started");
        self.progress.set_status(GroupStatus::Running).await;
        self.emit(ExecutionEvent::GroupStarted {
            group_id: group.id.clone(),
        });

        let executions = match group.mode {
            ExecutionMode::Sequential => {
                let mut executions = Vec::with_capacity(tasks.len());
                for task in tasks {
                    executions.push(self.run_task(task).await);
                }
                executions
            }
            ExecutionMode::Parallel => join_all(tasks.into_iter().map(|t| self.run_task(t))).await,
        };

        let status = self.group_status(&executions);
        self.progress.set_status(status).await;
        self.emit(ExecutionEvent::GroupFinished {
            group_id: group.id.clone(),
            status,
        });
        tracing::info!(group = %group.id, status = %status, "group finished");

        GroupResult {
            group_id: group.id.clone(),
            status,
            executions,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn group_status(&self, executions: &[TaskExecution]) -> GroupStatus {
        if self.halted_by.get().is_some() {
            GroupStatus::Halted
        } else if self.cancel.is_cancelled()
            && executions.iter().any(|e| !e.is_completed())
        {
            GroupStatus::Cancelled
        } else if executions.iter().all(TaskExecution::is_completed) {
            GroupStatus::Completed
        } else {
            GroupStatus::Failed
        }
    }

    async fn run_task(&self, mut task: Task) -> TaskExecution {
        if let Some(reason) = self.skip_reason() {
            tracing::debug!(task = %task.id, reason = %reason, "task not started");
            self.progress.task_skipped().await;
            self.emit(ExecutionEvent::TaskSkipped {
                task_id: task.id.clone(),
                reason: reason.clone(),
            });
            return TaskExecution::skipped(task, reason);
        }

        let mut transitions = Vec::new();
        task.start();
        self.progress.task_started(&task.id).await;

        let outcome = self.drive(&mut task, &mut transitions).await;

        match &outcome {
            TaskOutcome::Completed { commit_id } => {
                task.complete(commit_id);
                tracing::info!(task = %task.id, attempts = task.attempts, commit = %commit_id, "task completed");
                self.progress.task_finished(&task.id, true).await;
                self.emit(ExecutionEvent::TaskCompleted {
                    task_id: task.id.clone(),
                    commit_id: commit_id.clone(),
                });
            }
            TaskOutcome::Failed { error } => {
                task.fail();
                tracing::warn!(task = %task.id, attempts = task.attempts, error = %error, "task failed");
                self.progress.task_finished(&task.id, false).await;
                self.emit(ExecutionEvent::TaskFailed {
                    task_id: task.id.clone(),
                    error: error.clone(),
                });
            }
            TaskOutcome::Skipped { .. } => {}
        }

        TaskExecution {
            task,
            outcome,
            transitions,
        }
    }

    /// The retry loop. Returns Completed or Failed, never Skipped.
    async fn drive(&self, task: &mut Task, transitions: &mut Vec<PhaseTransition>) -> TaskOutcome {
        let collab = &self.collaborators;
        let max_iterations = self.settings.max_iterations.max(1);

        loop {
            if self.halt.is_cancelled() {
                return TaskOutcome::Failed {
                    error: self.interrupt_error(),
                };
            }

            self.enter(task, TaskPhase::Analyzing, transitions).await;
            let context = match self.guarded(collab.analyzer.context(task)).await {
                Step::Done(Ok(context)) => context,
                Step::Done(Err(e)) => {
                    return TaskOutcome::Failed {
                        error: TaskError::Analysis(e.to_string()),
                    }
                }
                Step::Interrupted => {
                    return TaskOutcome::Failed {
                        error: self.interrupt_error(),
                    }
                }
            };

            self.enter(task, TaskPhase::Mutating, transitions).await;
            let failure = match self.guarded(collab.mutator.apply(task, &context)).await {
                Step::Done(Err(e)) => TaskError::Mutation(e.to_string()),
                Step::Interrupted => self.interrupt_error(),
                Step::Done(Ok(())) => {
                    self.enter(task, TaskPhase::Verifying, transitions).await;
                    match self.guarded(collab.verifier.run(task)).await {
                        Step::Done(Ok(result)) if result.passed => {
                            self.enter(task, TaskPhase::Committing, transitions).await;
                            // Committing is never interrupted.
                            match self.timed(collab.vcs.commit(task)).await {
                                Ok(commit_id) => return TaskOutcome::Completed { commit_id },
                                Err(e) => TaskError::Commit(e.to_string()),
                            }
                        }
                        Step::Done(Ok(result)) => TaskError::Verification(result.details),
                        Step::Done(Err(e)) => TaskError::Verification(e.to_string()),
                        Step::Interrupted => self.interrupt_error(),
                    }
                }
            };

            tracing::debug!(task = %task.id, attempt = task.attempts + 1, error = %failure, "rolling back");
            self.enter(task, TaskPhase::RollingBack, transitions).await;
            let revert = self.timed(collab.vcs.revert(&task.resource_touches)).await;
            let attempts = task.record_attempt();

            if let Err(e) = revert {
                tracing::error!(task = %task.id, error = %e, "rollback failed, halting group");
                let _ = self.halted_by.set(task.id.clone());
                self.halt.cancel();
                return TaskOutcome::Failed {
                    error: TaskError::RollbackFailed(e.to_string()),
                };
            }

            if !failure.is_retryable() {
                return TaskOutcome::Failed { error: failure };
            }
            if attempts >= max_iterations {
                tracing::warn!(task = %task.id, attempts, "retry budget exhausted");
                return TaskOutcome::Failed { error: failure };
            }
            tracing::info!(task = %task.id, attempts, max_iterations, "retrying task");
        }
    }

    async fn enter(&self, task: &Task, phase: TaskPhase, transitions: &mut Vec<PhaseTransition>) {
        transitions.push(PhaseTransition {
            phase,
            attempt: task.attempts,
            at: Utc::now(),
        });
        self.progress.phase(&task.id, phase).await;
        self.emit(ExecutionEvent::PhaseEntered {
            group_id: self.group_id.clone(),
            task_id: task.id.clone(),
            phase,
            attempt: task.attempts,
        });
    }

    /// Apply the per-call timeout.
    async fn timed<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.settings.collaborator_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => call.await,
        }
    }

    /// Apply the timeout and race the call against cancellation or halt.
    async fn guarded<T, F>(&self, call: F) -> Step<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.halt.cancelled() => Step::Interrupted,
            result = self.timed(call) => Step::Done(result),
        }
    }

    fn skip_reason(&self) -> Option<SkipReason> {
        if let Some(by) = self.halted_by.get() {
            Some(SkipReason::GroupHalted { by: by.clone() })
        } else if self.cancel.is_cancelled() {
            Some(SkipReason::Cancelled)
        } else {
            None
        }
    }

    fn interrupt_error(&self) -> TaskError {
        match self.halted_by.get() {
            Some(by) if !self.cancel.is_cancelled() => TaskError::Halted { by: by.clone() },
            _ => TaskError::Cancelled,
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
