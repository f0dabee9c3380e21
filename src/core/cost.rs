//! Workload weights used by the batch planner.

use crate::core::task::Task;

/// Assigns a packing weight to a task.
pub trait CostModel: Send + Sync {
    fn weight(&self, task: &Task) -> u32;
}

/// The fixed ordinal mapping Low=1, Medium=2, High=4.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityCost;

impl CostModel for ComplexityCost {
    fn weight(&self, task: &Task) -> u32 {
        task.complexity.weight()
    }
}
