//! Core domain models for the batch scheduler.
//!
//! This module contains the task data model, the merged dependency graph
//! and the workload cost model the planner packs against.

pub mod cost;
pub mod dag;
pub mod task;

pub use cost::{ComplexityCost, CostModel};
pub use dag::{DependencyEdge, DependencyKind, TaskGraph};
pub use task::{Complexity, Task, TaskFile, TaskId, TaskStatus};
