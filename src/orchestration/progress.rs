//! Live progress shared between group executors and outside observers.
//!
//! Each group has exactly one writer, the [`ProgressWriter`] handed to its
//! executor. Observers poll [`ProgressStore::snapshot`]. Records are
//! replaced as whole `Arc`s, so a reader never sees a half-written record.

use crate::core::task::TaskId;
use crate::error::Result;
use crate::orchestration::executor::TaskPhase;
use crate::orchestration::planner::GroupId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Default interval at which dashboards are expected to poll.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 3;

/// Lifecycle of a group as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    #[default]
    Pending,
    Running,
    /// Every task completed.
    Completed,
    /// At least one task failed or was skipped.
    Failed,
    /// A rollback failed and the group stopped processing tasks.
    Halted,
    Cancelled,
    /// Every task was skipped before dispatch.
    Skipped,
}

impl GroupStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GroupStatus::Pending | GroupStatus::Running)
    }
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupStatus::Pending => write!(f, "pending"),
            GroupStatus::Running => write!(f, "running"),
            GroupStatus::Completed => write!(f, "completed"),
            GroupStatus::Failed => write!(f, "failed"),
            GroupStatus::Halted => write!(f, "halted"),
            GroupStatus::Cancelled => write!(f, "cancelled"),
            GroupStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProgressCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub fixed: usize,
    pub failed: usize,
}

impl ProgressCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.fixed + self.failed
    }
}

/// Progress of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub group_id: GroupId,
    pub stage: usize,
    pub status: GroupStatus,
    /// Current phase of every in-flight task.
    pub phases: BTreeMap<TaskId, TaskPhase>,
    pub counts: ProgressCounts,
    pub last_update: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(group_id: GroupId, stage: usize, pending: usize) -> Self {
        Self {
            group_id,
            stage,
            status: GroupStatus::Pending,
            phases: BTreeMap::new(),
            counts: ProgressCounts {
                pending,
                ..Default::default()
            },
            last_update: Utc::now(),
        }
    }
}

/// Concurrency-safe map of group id to its latest progress record.
#[derive(Debug, Clone, Default)]
pub struct ProgressStore {
    records: Arc<RwLock<HashMap<GroupId, Arc<ProgressRecord>>>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record for `record.group_id`.
    pub async fn update(&self, record: ProgressRecord) {
        let record = Arc::new(record);
        let mut records = self.records.write().await;
        records.insert(record.group_id.clone(), record);
    }

    pub async fn get(&self, group_id: &GroupId) -> Option<ProgressRecord> {
        let records = self.records.read().await;
        records.get(group_id).map(|r| r.as_ref().clone())
    }

    /// Consistent copy of every record, ordered by group id.
    pub async fn snapshot(&self) -> BTreeMap<GroupId, ProgressRecord> {
        let records: Vec<Arc<ProgressRecord>> = {
            let guard = self.records.read().await;
            guard.values().cloned().collect()
        };
        records
            .into_iter()
            .map(|r| (r.group_id.clone(), r.as_ref().clone()))
            .collect()
    }

    pub async fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot().await)?)
    }

    /// Write the snapshot as JSON to `path`, via a temp file and rename so
    /// readers never see a partial file.
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        let json = self.to_json().await?;
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Create the single writer for `group_id` and publish its first record.
    pub async fn writer(&self, group_id: GroupId, stage: usize, pending: usize) -> ProgressWriter {
        let record = ProgressRecord::new(group_id, stage, pending);
        self.update(record.clone()).await;
        ProgressWriter {
            store: self.clone(),
            record: Mutex::new(record),
        }
    }
}

/// The one writer allowed to update a group's record.
///
/// Tasks of a parallel group share the writer; edits are serialized on a
/// private copy that is then published as a whole.
#[derive(Debug)]
pub struct ProgressWriter {
    store: ProgressStore,
    record: Mutex<ProgressRecord>,
}

impl ProgressWriter {
    /// Apply `edit` to the group's record and publish the result.
    pub async fn publish<F>(&self, edit: F)
    where
        F: FnOnce(&mut ProgressRecord),
    {
        let mut record = self.record.lock().await;
        edit(&mut record);
        record.last_update = Utc::now();
        self.store.update(record.clone()).await;
    }

    pub async fn set_status(&self, status: GroupStatus) {
        self.publish(|r| r.status = status).await;
    }

    pub async fn task_started(&self, task: &TaskId) {
        let task = task.clone();
        self.publish(move |r| {
            r.counts.pending = r.counts.pending.saturating_sub(1);
            r.counts.in_progress += 1;
            r.phases.insert(task, TaskPhase::Analyzing);
        })
        .await;
    }

    pub async fn phase(&self, task: &TaskId, phase: TaskPhase) {
        let task = task.clone();
        self.publish(move |r| {
            r.phases.insert(task, phase);
        })
        .await;
    }

    pub async fn task_finished(&self, task: &TaskId, fixed: bool) {
        let task = task.clone();
        self.publish(move |r| {
            r.phases.remove(&task);
            r.counts.in_progress = r.counts.in_progress.saturating_sub(1);
            if fixed {
                r.counts.fixed += 1;
            } else {
                r.counts.failed += 1;
            }
        })
        .await;
    }

    /// A task of this group that will never start.
    pub async fn task_skipped(&self) {
        self.publish(|r| {
            r.counts.pending = r.counts.pending.saturating_sub(1);
            r.counts.failed += 1;
        })
        .await;
    }

    pub async fn current(&self) -> ProgressRecord {
        self.record.lock().await.clone()
    }
}
