use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Dependency cycle detected at task {task} ({})", format_path(.path))]
    Cycle { task: TaskId, path: Vec<TaskId> },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Why a single task ended in the Failed state.
///
/// Produced by the group executor; the variant decides whether the task
/// was retried and whether its group keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum TaskError {
    /// The analyzer rejected the task. Never retried.
    #[error("analysis failed: {0}")]
    Analysis(String),
    /// Applying the change failed.
    #[error("mutation failed: {0}")]
    Mutation(String),
    /// The verification step did not pass.
    #[error("verification failed: {0}")]
    Verification(String),
    /// Verification passed but the commit could not be recorded.
    #[error("commit failed: {0}")]
    Commit(String),
    /// Reverting the task's resources failed; resource state is unknown.
    #[error("rollback failed: {0}")]
    RollbackFailed(String),
    /// The run was cancelled while the task was in flight.
    #[error("cancelled")]
    Cancelled,
    /// A sibling task's failed rollback halted the group.
    #[error("group halted by failed rollback of {by}")]
    Halted { by: TaskId },
    /// The runtime task driving the group panicked or was aborted.
    #[error("group aborted: {0}")]
    Aborted(String),
}

impl TaskError {
    /// Whether another attempt may follow this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::Mutation(_) | TaskError::Verification(_) | TaskError::Commit(_)
        )
    }

    /// Whether this failure stops the rest of the group.
    pub fn halts_group(&self) -> bool {
        matches!(self, TaskError::RollbackFailed(_))
    }
}
