//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of work the scheduler batches and drives
//! through analyze, mutate, verify and commit. Each task carries its
//! explicit dependencies, the resources it mutates and its retry count.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Unique identifier for a task, supplied by the plan author.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("task id must not be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Ordinal complexity label attached to a task by the plan author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    /// Workload weight used for batch packing: Low=1, Medium=2, High=4.
    pub const fn weight(self) -> u32 {
        match self {
            Complexity::Low => 1,
            Complexity::Medium => 2,
            Complexity::High => 4,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Low => write!(f, "low"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::High => write!(f, "high"),
        }
    }
}

/// Task status in its lifecycle.
///
/// Only the group executor moves a task out of Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A single unit of work in the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Short human-readable name.
    pub title: String,
    /// What the task should accomplish.
    #[serde(default)]
    pub description: String,
    /// Drives the task's packing weight.
    #[serde(default)]
    pub complexity: Complexity,
    /// Tasks that must complete before this one starts.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Resources (typically repository-relative paths) this task mutates.
    #[serde(default)]
    pub resource_touches: Vec<String>,
    // Lifecycle fields below are owned by the executor and never read from input.
    #[serde(skip_deserializing)]
    pub status: TaskStatus,
    /// Number of rollbacks this task has gone through.
    #[serde(skip_deserializing)]
    pub attempts: u32,
    /// Commit recorded when the task completed.
    #[serde(skip_deserializing)]
    pub commit_id: Option<String>,
    #[serde(skip_deserializing)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_deserializing)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending Medium task with no dependencies or resources.
    pub fn new(id: impl Into<TaskId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: String::new(),
            complexity: Complexity::default(),
            dependencies: Vec::new(),
            resource_touches: Vec::new(),
            status: TaskStatus::Pending,
            attempts: 0,
            commit_id: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// Add an explicit dependency. Duplicates are ignored.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        let id = id.into();
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    /// Append a resource this task mutates.
    pub fn touches(mut self, resource: &str) -> Self {
        self.resource_touches.push(resource.to_string());
        self
    }

    /// Transition to InProgress and record the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Mark the task Completed with the commit that persisted it.
    pub fn complete(&mut self, commit_id: &str) {
        self.status = TaskStatus::Completed;
        self.commit_id = Some(commit_id.to_string());
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    /// Count one rollback. Returns the new attempt count.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn weight(&self) -> u32 {
        self.complexity.weight()
    }
}

/// On-disk task list, either `{"tasks": [...]}` JSON or `[[tasks]]` TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl TaskFile {
    /// Load a task file, picking the format from the extension.
    pub fn load(path: &Path) -> Result<Vec<Task>> {
        let content = std::fs::read_to_string(path)?;
        let file: TaskFile = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") | None => serde_json::from_str(&content)?,
            Some(other) => {
                return Err(Error::Validation(format!(
                    "unsupported task file extension: {}",
                    other
                )))
            }
        };
        tracing::debug!(path = %path.display(), tasks = file.tasks.len(), "task file loaded");
        Ok(file.tasks)
    }
}
