//! Interfaces to the external collaborators a group executor drives.
//!
//! The scheduler never edits files or runs tests itself. It asks an
//! [`Analyzer`] for context, a [`Mutator`] to apply the change, a
//! [`Verifier`] to judge it and a [`Vcs`] to commit or revert it.

use crate::core::task::{Task, TaskId};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Read-only context gathered before a mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub task_id: TaskId,
    /// Free-form notes for the mutator.
    #[serde(default)]
    pub notes: String,
    /// Current content of each touched resource; `None` when it does not exist.
    #[serde(default)]
    pub resources: BTreeMap<String, Option<String>>,
}

impl ContextBundle {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            ..Default::default()
        }
    }
}

/// Outcome of a verification run. Pass is binary: every check must pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResult {
    pub passed: bool,
    pub details: String,
}

impl VerifyResult {
    pub fn passed(details: impl Into<String>) -> Self {
        Self {
            passed: true,
            details: details.into(),
        }
    }

    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: details.into(),
        }
    }
}

/// Gathers context for a task. Must not have side effects.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn context(&self, task: &Task) -> Result<ContextBundle>;
}

/// Applies a task's change to its resources.
#[async_trait]
pub trait Mutator: Send + Sync {
    async fn apply(&self, task: &Task, context: &ContextBundle) -> Result<()>;
}

/// Checks whether the applied change is acceptable.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn run(&self, task: &Task) -> Result<VerifyResult>;
}

/// Persists or discards changes to resources.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Restore `resources` to their last committed state.
    async fn revert(&self, resources: &[String]) -> Result<()>;
    /// Persist the task's changes and return the commit id.
    async fn commit(&self, task: &Task) -> Result<String>;
}

/// The four collaborators a run needs, shared across groups.
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn Analyzer>,
    pub mutator: Arc<dyn Mutator>,
    pub verifier: Arc<dyn Verifier>,
    pub vcs: Arc<dyn Vcs>,
}

impl Collaborators {
    pub fn new(
        analyzer: Arc<dyn Analyzer>,
        mutator: Arc<dyn Mutator>,
        verifier: Arc<dyn Verifier>,
        vcs: Arc<dyn Vcs>,
    ) -> Self {
        Self {
            analyzer,
            mutator,
            verifier,
            vcs,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
