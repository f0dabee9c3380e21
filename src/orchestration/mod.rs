//! Orchestration layer: planning and executing batches of tasks.
//!
//! The [`BatchPlanner`] packs a task graph into stages of groups; the
//! [`Orchestrator`] runs each stage's groups concurrently through a
//! [`GroupExecutor`], publishing live state to a [`ProgressStore`].

mod collaborators;
mod executor;
mod local;
mod orchestrator;
mod planner;
mod progress;

pub use collaborators::{Analyzer, Collaborators, ContextBundle, Mutator, Vcs, Verifier, VerifyResult};
pub use executor::{
    ExecutionEvent, ExecutorSettings, GroupExecutor, GroupResult, PhaseTransition, SkipReason,
    TaskExecution, TaskOutcome, TaskPhase, DEFAULT_MAX_ITERATIONS,
};
pub use local::{CommandMutator, CommandVerifier, FileAnalyzer};
pub use orchestrator::{
    CompletedTask, FailedTask, FinalReport, Orchestrator, SkippedTask, StageTimeline,
};
pub use planner::{
    plan, BatchPlanner, ExecutionMode, ExecutionPlan, Group, GroupId, PlanSummary, Stage,
    DEFAULT_MAX_BATCH_COST,
};
pub use progress::{
    GroupStatus, ProgressCounts, ProgressRecord, ProgressStore, ProgressWriter,
    DEFAULT_POLL_INTERVAL_SECS,
};
