//! In-memory scheduled-task store (dev/test, single process).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use jobhost_core::{TaskId, WorkerId};

use super::{
    task_lease_name, NewScheduledTask, ScheduledTask, ScheduledTaskStore, TaskRun, TaskStatus,
};
use crate::error::StoreError;
use crate::lease::InMemoryLeaseStore;

/// In-memory scheduled-task store.
///
/// Shares the lease store the dispatcher uses so that `get_due` can see
/// whether a `Running` task still has a live runner.
#[derive(Debug)]
pub struct InMemoryScheduledTaskStore {
    leases: Arc<InMemoryLeaseStore>,
    tasks: RwLock<HashMap<TaskId, ScheduledTask>>,
}

impl InMemoryScheduledTaskStore {
    pub fn new(leases: Arc<InMemoryLeaseStore>) -> Self {
        Self {
            leases,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    fn update<F>(&self, id: &TaskId, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut ScheduledTask),
    {
        let mut tasks = self.tasks.write().map_err(|_| StoreError::poisoned())?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("scheduled task '{id}'")))?;
        f(task);
        task.version += 1;
        Ok(())
    }

    /// Apply `f` only while the task still belongs to `run`.
    fn update_run<F>(&self, id: &TaskId, run: TaskRun, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut ScheduledTask),
    {
        let mut tasks = self.tasks.write().map_err(|_| StoreError::poisoned())?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("scheduled task '{id}'")))?;
        if task.worker_id != Some(run.worker_id) || task.execution_count != run.execution_count {
            return Ok(false);
        }
        f(task);
        task.version += 1;
        Ok(true)
    }
}

#[async_trait]
impl ScheduledTaskStore for InMemoryScheduledTaskStore {
    async fn register(&self, new_task: NewScheduledTask) -> Result<ScheduledTask, StoreError> {
        let mut tasks = self.tasks.write().map_err(|_| StoreError::poisoned())?;

        match tasks.get_mut(&new_task.id) {
            Some(existing) => {
                if existing.schedule != new_task.schedule && existing.enabled {
                    existing.next_execution = new_task.next_execution;
                }
                existing.group = new_task.group;
                existing.description = new_task.description;
                existing.task_type = new_task.task_type;
                existing.schedule = new_task.schedule;
                existing.version += 1;
                Ok(existing.clone())
            }
            None => {
                let task = new_task.into_task();
                tasks.insert(task.id.clone(), task.clone());
                Ok(task)
            }
        }
    }

    async fn get(&self, id: &TaskId) -> Result<Option<ScheduledTask>, StoreError> {
        let tasks = self.tasks.read().map_err(|_| StoreError::poisoned())?;
        Ok(tasks.get(id).cloned())
    }

    async fn list(&self, group: Option<&str>) -> Result<Vec<ScheduledTask>, StoreError> {
        let tasks = self.tasks.read().map_err(|_| StoreError::poisoned())?;
        let mut out: Vec<_> = tasks
            .values()
            .filter(|t| group.is_none_or(|g| t.group == g))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, StoreError> {
        let candidates: Vec<ScheduledTask> = {
            let tasks = self.tasks.read().map_err(|_| StoreError::poisoned())?;
            tasks
                .values()
                .filter(|t| t.enabled && (t.is_due(now) || t.status == TaskStatus::Running))
                .cloned()
                .collect()
        };

        let mut due = Vec::with_capacity(candidates.len());
        for task in candidates {
            if task.status == TaskStatus::Running
                && self.leases.is_held(&task_lease_name(&task.id), now)?
            {
                continue;
            }
            due.push(task);
        }
        due.sort_by(|a, b| {
            a.next_execution
                .cmp(&b.next_execution)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(due)
    }

    async fn mark_started(
        &self,
        id: &TaskId,
        expected_version: u64,
        worker_id: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().map_err(|_| StoreError::poisoned())?;
        let Some(task) = tasks.get_mut(id) else {
            return Ok(false);
        };
        if task.version != expected_version || !task.enabled {
            return Ok(false);
        }

        task.status = TaskStatus::Running;
        task.worker_id = Some(worker_id);
        task.last_execution = Some(now);
        task.execution_count += 1;
        task.version += 1;
        Ok(true)
    }

    async fn mark_completed(
        &self,
        id: &TaskId,
        run: TaskRun,
        next_execution: Option<DateTime<Utc>>,
        progress: Option<Value>,
        state: Option<Value>,
    ) -> Result<bool, StoreError> {
        self.update_run(id, run, |task| {
            task.progress = progress;
            task.state = state;
            if task.enabled {
                task.status = TaskStatus::Succeeded;
                task.next_execution = next_execution;
            } else {
                task.status = TaskStatus::Disabled;
                task.next_execution = None;
            }
        })
    }

    async fn mark_faulted(
        &self,
        id: &TaskId,
        run: TaskRun,
        error: &str,
        next_execution: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.update_run(id, run, |task| {
            task.errors += 1;
            task.last_error = Some(error.to_string());
            task.last_error_date = Some(now);
            if task.enabled {
                task.status = TaskStatus::Faulted;
                task.next_execution = next_execution;
            } else {
                task.status = TaskStatus::Disabled;
                task.next_execution = None;
            }
        })
    }

    async fn set_enabled(
        &self,
        id: &TaskId,
        enabled: bool,
        next_execution: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.update(id, |task| match (task.enabled, enabled) {
            (_, false) => {
                task.enabled = false;
                task.status = TaskStatus::Disabled;
                task.next_execution = None;
            }
            (false, true) => {
                task.enabled = true;
                task.status = TaskStatus::Idle;
                task.next_execution = next_execution;
            }
            (true, true) => {}
        })
    }
}
