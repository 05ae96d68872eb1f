//! Scheduled-task records and cron schedules.
//!
//! One row per named recurring task holds its schedule, run bookkeeping and
//! the opaque state carried between runs. Dispatch is guarded twice: a task
//! lease (see [`task_lease_name`]) and a version check in `mark_started`.

pub mod cron;
mod in_memory;
mod postgres;

pub use self::cron::{CronSchedule, ScheduleError};
pub use in_memory::InMemoryScheduledTaskStore;
pub use postgres::PostgresScheduledTaskStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobhost_core::{TaskId, WorkerId};

use crate::error::StoreError;

/// Prefix of the lease held while a task runs.
pub const TASK_LEASE_PREFIX: &str = "scheduled-task:";

/// Name of the lease guarding runs of `id`.
pub fn task_lease_name(id: &TaskId) -> String {
    format!("{TASK_LEASE_PREFIX}{id}")
}

/// Run status of a scheduled task.
///
/// `Idle → Running → {Succeeded, Faulted}`, after which the task is eligible
/// again. `Disabled` is entered from any state and left only by re-enabling.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Succeeded,
    Faulted,
    Disabled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Faulted => "faulted",
            TaskStatus::Disabled => "disabled",
        }
    }

    /// Resting states the dispatcher may pick up once due.
    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Idle | TaskStatus::Succeeded | TaskStatus::Faulted
        )
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TaskStatus::Idle),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "faulted" => Ok(TaskStatus::Faulted),
            "disabled" => Ok(TaskStatus::Disabled),
            other => Err(StoreError::Serialization(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

/// Durable state of a recurring task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub group: String,
    pub description: String,
    pub task_type: String,
    /// Cron expression.
    pub schedule: String,
    /// Worker that ran (or is running) the last execution.
    pub worker_id: Option<WorkerId>,
    pub last_execution: Option<DateTime<Utc>>,
    pub next_execution: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub status: TaskStatus,
    /// Number of faulted runs.
    pub errors: u64,
    pub last_error: Option<String>,
    pub last_error_date: Option<DateTime<Utc>>,
    pub state: Option<Value>,
    pub progress: Option<Value>,
    pub enabled: bool,
    pub version: u64,
}

impl ScheduledTask {
    /// Due by schedule, ignoring stuck-run recovery.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.status.is_dispatchable()
            && self.next_execution.is_some_and(|next| next <= now)
    }

    pub fn lease_name(&self) -> String {
        task_lease_name(&self.id)
    }
}

/// Registration input for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewScheduledTask {
    pub id: TaskId,
    pub group: String,
    pub description: String,
    pub task_type: String,
    pub schedule: String,
    /// First due time, used when the row is created or the schedule changes.
    pub next_execution: Option<DateTime<Utc>>,
    /// State handed to the first run.
    pub initial_state: Option<Value>,
}

impl NewScheduledTask {
    pub(crate) fn into_task(self) -> ScheduledTask {
        ScheduledTask {
            id: self.id,
            group: self.group,
            description: self.description,
            task_type: self.task_type,
            schedule: self.schedule,
            worker_id: None,
            last_execution: None,
            next_execution: self.next_execution,
            execution_count: 0,
            status: TaskStatus::Idle,
            errors: 0,
            last_error: None,
            last_error_date: None,
            state: self.initial_state,
            progress: None,
            enabled: true,
            version: 0,
        }
    }
}

/// One run of a task: the worker that started it and the execution count
/// `mark_started` gave it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TaskRun {
    pub worker_id: WorkerId,
    pub execution_count: u64,
}

impl TaskRun {
    /// The run `worker_id` starts from the `task` snapshot.
    pub fn started_from(task: &ScheduledTask, worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            execution_count: task.execution_count + 1,
        }
    }
}

/// Scheduled-task persistence.
#[async_trait]
pub trait ScheduledTaskStore: Send + Sync {
    /// Insert the task if absent; otherwise refresh its tags and schedule and
    /// keep its run state. A changed schedule also resets `next_execution`.
    async fn register(&self, task: NewScheduledTask) -> Result<ScheduledTask, StoreError>;

    async fn get(&self, id: &TaskId) -> Result<Option<ScheduledTask>, StoreError>;

    /// All tasks, or those of one group.
    async fn list(&self, group: Option<&str>) -> Result<Vec<ScheduledTask>, StoreError>;

    /// Enabled tasks that are due at `now`, plus `Running` tasks whose task
    /// lease is gone or expired (the runner died mid-run).
    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, StoreError>;

    /// Move a task to `Running` if its version is still `expected_version`.
    ///
    /// Returns `false` when another worker got there first.
    async fn mark_started(
        &self,
        id: &TaskId,
        expected_version: u64,
        worker_id: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Record a successful run.
    ///
    /// Returns `false`, writing nothing, when the row no longer belongs to
    /// `run` (another worker restarted the task after this run lost its lease).
    async fn mark_completed(
        &self,
        id: &TaskId,
        run: TaskRun,
        next_execution: Option<DateTime<Utc>>,
        progress: Option<Value>,
        state: Option<Value>,
    ) -> Result<bool, StoreError>;

    /// Record a failed run. Same ownership rule as `mark_completed`.
    async fn mark_faulted(
        &self,
        id: &TaskId,
        run: TaskRun,
        error: &str,
        next_execution: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Soft-disable (clears `next_execution`) or re-enable (status `Idle`,
    /// fresh `next_execution`). Re-enabling an enabled task changes nothing.
    async fn set_enabled(
        &self,
        id: &TaskId,
        enabled: bool,
        next_execution: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}
