//! Dependency-aware batch scheduler for code-change tasks.
//!
//! Tasks declare explicit dependencies and the resources they touch. The
//! [`core::TaskGraph`] merges both into one acyclic graph, the
//! [`orchestration::BatchPlanner`] packs it into stages of cost-bounded
//! groups, and the [`orchestration::Orchestrator`] drives every task
//! through analyze, mutate, verify and commit, rolling back on failure.

pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod util;

pub use error::{Error, Result, TaskError};
pub use orchestration::{plan, ExecutionPlan, FinalReport, Orchestrator, ProgressStore};
