//! Postgres-backed scheduled-task store.
//!
//! `mark_started` is the dispatch guard: an `UPDATE … WHERE version = $expected`
//! that only one of several racing workers can match. `get_due` joins
//! `job_leases` so a `Running` task whose runner's lease lapsed is offered
//! again. Outcome writes carry the run's worker and execution count, so a run
//! that lost its lease cannot overwrite the run that replaced it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use jobhost_core::{TaskId, WorkerId};

use super::{
    NewScheduledTask, ScheduledTask, ScheduledTaskStore, TaskRun, TaskStatus, TASK_LEASE_PREFIX,
};
use crate::error::{map_sqlx_error, StoreError};

const TASK_COLUMNS: &str = r#"
    t.id, t.task_group, t.description, t.task_type, t.schedule, t.worker_id,
    t.last_execution, t.next_execution, t.execution_count, t.status, t.errors,
    t.last_error, t.last_error_date, t.state, t.progress, t.enabled, t.version
"#;

/// Postgres-backed scheduled-task store over `job_scheduled_tasks`.
#[derive(Debug, Clone)]
pub struct PostgresScheduledTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresScheduledTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn update_one(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        id: &TaskId,
    ) -> Result<(), StoreError> {
        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("scheduled task '{id}'")));
        }
        Ok(())
    }

    /// Like `update_one`, but a row that exists and no longer belongs to the
    /// run is `Ok(false)` rather than `NotFound`.
    async fn update_run(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        id: &TaskId,
    ) -> Result<bool, StoreError> {
        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM job_scheduled_tasks WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("scheduled task '{id}'"))),
        }
    }
}

#[async_trait]
impl ScheduledTaskStore for PostgresScheduledTaskStore {
    #[instrument(skip(self, task), fields(task_id = %task.id), err)]
    async fn register(&self, task: NewScheduledTask) -> Result<ScheduledTask, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO job_scheduled_tasks AS t
                (id, task_group, description, task_type, schedule, next_execution,
                 execution_count, status, errors, state, enabled, version)
            VALUES ($1, $2, $3, $4, $5, $6, 0, 'idle', 0, $7, TRUE, 0)
            ON CONFLICT (id) DO UPDATE
               SET task_group = EXCLUDED.task_group,
                   description = EXCLUDED.description,
                   task_type = EXCLUDED.task_type,
                   schedule = EXCLUDED.schedule,
                   next_execution = CASE
                       WHEN t.schedule <> EXCLUDED.schedule AND t.enabled
                       THEN EXCLUDED.next_execution
                       ELSE t.next_execution
                   END,
                   version = t.version + 1
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task.id.as_str())
        .bind(&task.group)
        .bind(&task.description)
        .bind(&task.task_type)
        .bind(&task.schedule)
        .bind(task.next_execution)
        .bind(&task.initial_state)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("register_task", e))?;

        decode_task(&row, "register_task")
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get(&self, id: &TaskId) -> Result<Option<ScheduledTask>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM job_scheduled_tasks t WHERE t.id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_task", e))?;

        row.map(|row| decode_task(&row, "get_task")).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, group: Option<&str>) -> Result<Vec<ScheduledTask>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
              FROM job_scheduled_tasks t
             WHERE ($1::TEXT IS NULL OR t.task_group = $1)
             ORDER BY t.id
            "#
        ))
        .bind(group)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_tasks", e))?;

        rows.iter().map(|row| decode_task(row, "list_tasks")).collect()
    }

    #[instrument(skip(self), err)]
    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
              FROM job_scheduled_tasks t
              LEFT JOIN job_leases l ON l.name = $2 || t.id
             WHERE t.enabled
               AND (
                    (t.status <> 'running' AND t.next_execution <= $1)
                 OR (t.status = 'running' AND (l.name IS NULL OR l.expires_at <= $1))
               )
             ORDER BY t.next_execution ASC NULLS LAST, t.id ASC
            "#
        ))
        .bind(now)
        .bind(TASK_LEASE_PREFIX)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_due", e))?;

        rows.iter().map(|row| decode_task(row, "get_due")).collect()
    }

    #[instrument(skip(self), fields(task_id = %id, worker_id = %worker_id), err)]
    async fn mark_started(
        &self,
        id: &TaskId,
        expected_version: u64,
        worker_id: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_scheduled_tasks
               SET status = 'running',
                   worker_id = $3,
                   last_execution = $4,
                   execution_count = execution_count + 1,
                   version = version + 1
             WHERE id = $1 AND version = $2 AND enabled
            "#,
        )
        .bind(id.as_str())
        .bind(version_param(expected_version))
        .bind(worker_id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_started", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, progress, state), fields(task_id = %id, worker_id = %run.worker_id), err)]
    async fn mark_completed(
        &self,
        id: &TaskId,
        run: TaskRun,
        next_execution: Option<DateTime<Utc>>,
        progress: Option<Value>,
        state: Option<Value>,
    ) -> Result<bool, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE job_scheduled_tasks
               SET status = CASE WHEN enabled THEN 'succeeded' ELSE 'disabled' END,
                   next_execution = CASE WHEN enabled THEN $4 ELSE NULL END,
                   progress = $5,
                   state = $6,
                   version = version + 1
             WHERE id = $1 AND worker_id = $2 AND execution_count = $3
            "#,
        )
        .bind(id.as_str())
        .bind(run.worker_id.as_uuid())
        .bind(version_param(run.execution_count))
        .bind(next_execution)
        .bind(progress)
        .bind(state);

        self.update_run("mark_completed", query, id).await
    }

    #[instrument(skip(self), fields(task_id = %id, worker_id = %run.worker_id), err)]
    async fn mark_faulted(
        &self,
        id: &TaskId,
        run: TaskRun,
        error: &str,
        next_execution: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE job_scheduled_tasks
               SET status = CASE WHEN enabled THEN 'faulted' ELSE 'disabled' END,
                   next_execution = CASE WHEN enabled THEN $4 ELSE NULL END,
                   errors = errors + 1,
                   last_error = $5,
                   last_error_date = $6,
                   version = version + 1
             WHERE id = $1 AND worker_id = $2 AND execution_count = $3
            "#,
        )
        .bind(id.as_str())
        .bind(run.worker_id.as_uuid())
        .bind(version_param(run.execution_count))
        .bind(next_execution)
        .bind(error)
        .bind(now);

        self.update_run("mark_faulted", query, id).await
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn set_enabled(
        &self,
        id: &TaskId,
        enabled: bool,
        next_execution: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let query = if enabled {
            // Column references on the right-hand side see the pre-update row.
            sqlx::query(
                r#"
                UPDATE job_scheduled_tasks
                   SET status = CASE WHEN enabled THEN status ELSE 'idle' END,
                       next_execution = CASE WHEN enabled THEN next_execution ELSE $2 END,
                       version = CASE WHEN enabled THEN version ELSE version + 1 END,
                       enabled = TRUE
                 WHERE id = $1
                "#,
            )
            .bind(id.as_str())
            .bind(next_execution)
        } else {
            sqlx::query(
                r#"
                UPDATE job_scheduled_tasks
                   SET enabled = FALSE,
                       status = 'disabled',
                       next_execution = NULL,
                       version = version + 1
                 WHERE id = $1
                "#,
            )
            .bind(id.as_str())
        };

        self.update_one("set_enabled", query, id).await
    }
}

fn version_param(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn decode_task(row: &PgRow, operation: &str) -> Result<ScheduledTask, StoreError> {
    let row = TaskRow::from_row(row).map_err(|e| StoreError::corrupt_row(operation, e))?;
    ScheduledTask::try_from(row)
}

struct TaskRow {
    id: String,
    task_group: String,
    description: String,
    task_type: String,
    schedule: String,
    worker_id: Option<Uuid>,
    last_execution: Option<DateTime<Utc>>,
    next_execution: Option<DateTime<Utc>>,
    execution_count: i64,
    status: String,
    errors: i64,
    last_error: Option<String>,
    last_error_date: Option<DateTime<Utc>>,
    state: Option<Value>,
    progress: Option<Value>,
    enabled: bool,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_group: row.try_get("task_group")?,
            description: row.try_get("description")?,
            task_type: row.try_get("task_type")?,
            schedule: row.try_get("schedule")?,
            worker_id: row.try_get("worker_id")?,
            last_execution: row.try_get("last_execution")?,
            next_execution: row.try_get("next_execution")?,
            execution_count: row.try_get("execution_count")?,
            status: row.try_get("status")?,
            errors: row.try_get("errors")?,
            last_error: row.try_get("last_error")?,
            last_error_date: row.try_get("last_error_date")?,
            state: row.try_get("state")?,
            progress: row.try_get("progress")?,
            enabled: row.try_get("enabled")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<TaskRow> for ScheduledTask {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: TaskId::new(row.id).map_err(|e| StoreError::Serialization(e.to_string()))?,
            group: row.task_group,
            description: row.description,
            task_type: row.task_type,
            schedule: row.schedule,
            worker_id: row.worker_id.map(WorkerId::from_uuid),
            last_execution: row.last_execution,
            next_execution: row.next_execution,
            execution_count: u64::try_from(row.execution_count).unwrap_or(0),
            status: row.status.parse::<TaskStatus>()?,
            errors: u64::try_from(row.errors).unwrap_or(0),
            last_error: row.last_error,
            last_error_date: row.last_error_date,
            state: row.state,
            progress: row.progress,
            enabled: row.enabled,
            version: u64::try_from(row.version).unwrap_or(0),
        })
    }
}
