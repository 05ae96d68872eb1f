//! Table definitions for the Postgres stores.
//!
//! `ensure_schema` is idempotent; every host may call it at startup.

use sqlx::PgPool;
use tracing::{info, instrument};

use crate::error::{map_sqlx_error, StoreError};

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS job_leases (
        name        TEXT PRIMARY KEY,
        owner       UUID NOT NULL,
        acquired_at TIMESTAMPTZ NOT NULL,
        duration_ms BIGINT NOT NULL CHECK (duration_ms >= 0),
        expires_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_queue_messages (
        id            UUID PRIMARY KEY,
        queue_name    TEXT NOT NULL,
        payload       JSONB NOT NULL,
        enqueued_at   TIMESTAMPTZ NOT NULL,
        visible_after TIMESTAMPTZ NOT NULL,
        dequeue_count INTEGER NOT NULL DEFAULT 0 CHECK (dequeue_count >= 0),
        version       BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS job_queue_messages_poll_idx
        ON job_queue_messages (queue_name, visible_after, enqueued_at, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_dead_letters (
        id               UUID PRIMARY KEY,
        queue_name       TEXT NOT NULL,
        payload          JSONB NOT NULL,
        enqueued_at      TIMESTAMPTZ NOT NULL,
        dequeue_count    INTEGER NOT NULL,
        reason           TEXT NOT NULL,
        dead_lettered_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS job_dead_letters_queue_idx
        ON job_dead_letters (queue_name, dead_lettered_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_scheduled_tasks (
        id              VARCHAR(200) PRIMARY KEY,
        task_group      TEXT NOT NULL,
        description     TEXT NOT NULL,
        task_type       TEXT NOT NULL,
        schedule        TEXT NOT NULL,
        worker_id       UUID NULL,
        last_execution  TIMESTAMPTZ NULL,
        next_execution  TIMESTAMPTZ NULL,
        execution_count BIGINT NOT NULL DEFAULT 0,
        status          TEXT NOT NULL CHECK (status IN ('idle', 'running', 'succeeded', 'faulted', 'disabled')),
        errors          BIGINT NOT NULL DEFAULT 0,
        last_error      TEXT NULL,
        last_error_date TIMESTAMPTZ NULL,
        state           JSONB NULL,
        progress        JSONB NULL,
        enabled         BOOLEAN NOT NULL DEFAULT TRUE,
        version         BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS job_scheduled_tasks_due_idx
        ON job_scheduled_tasks (next_execution)
        WHERE enabled
    "#,
];

/// Create the job tables and indexes if they do not exist.
#[instrument(skip(pool), err)]
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    for statement in STATEMENTS {
        sqlx::query(*statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }
    info!(tables = 4, "job schema ensured");
    Ok(())
}
