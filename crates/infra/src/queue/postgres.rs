//! Postgres-backed queue store.
//!
//! ## Claim protocol
//!
//! `poll_next` reads the oldest visible `(id, version)` and then runs
//!
//! ```sql
//! UPDATE job_queue_messages
//!    SET visible_after = now + window, dequeue_count = dequeue_count + 1, version = version + 1
//!  WHERE id = $id AND version = $seen_version
//! ```
//!
//! Of several pollers that read the same version exactly one update matches a
//! row. Losers re-read and retry up to `MAX_CLAIM_ATTEMPTS` times.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument, Span};
use uuid::Uuid;

use jobhost_core::{add_duration, Clock, MessageId, SystemClock};

use super::{validate_queue_name, DeadLetterEntry, QueueMessage, QueueStore, MAX_CLAIM_ATTEMPTS};
use crate::error::{map_sqlx_error, StoreError};

const MESSAGE_COLUMNS: &str =
    "id, queue_name, payload, enqueued_at, visible_after, dequeue_count, version";

/// Postgres-backed queue store over `job_queue_messages` / `job_dead_letters`.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: Arc::new(pool),
            clock,
        }
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self, payload), err)]
    async fn enqueue(
        &self,
        queue: &str,
        payload: Value,
        visibility_delay: Duration,
    ) -> Result<MessageId, StoreError> {
        validate_queue_name(queue)?;
        let id = MessageId::new();
        let now = self.clock.now();

        sqlx::query(
            r#"
            INSERT INTO job_queue_messages
                (id, queue_name, payload, enqueued_at, visible_after, dequeue_count, version)
            VALUES ($1, $2, $3, $4, $5, 0, 0)
            "#,
        )
        .bind(id.as_uuid())
        .bind(queue)
        .bind(&payload)
        .bind(now)
        .bind(add_duration(now, visibility_delay))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(id)
    }

    #[instrument(skip(self, payloads), fields(batch_size = payloads.len()), err)]
    async fn enqueue_batch(
        &self,
        queue: &str,
        payloads: Vec<Value>,
        visibility_delay: Duration,
    ) -> Result<Vec<MessageId>, StoreError> {
        validate_queue_name(queue)?;
        let now = self.clock.now();
        let visible_after = add_duration(now, visibility_delay);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let id = MessageId::new();
            sqlx::query(
                r#"
                INSERT INTO job_queue_messages
                    (id, queue_name, payload, enqueued_at, visible_after, dequeue_count, version)
                VALUES ($1, $2, $3, $4, $5, 0, 0)
                "#,
            )
            .bind(id.as_uuid())
            .bind(queue)
            .bind(&payload)
            .bind(now)
            .bind(visible_after)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("enqueue_batch", e))?;
            ids.push(id);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(ids)
    }

    #[instrument(
        skip(self),
        fields(message_id = tracing::field::Empty, attempts = tracing::field::Empty),
        err
    )]
    async fn poll_next(
        &self,
        queue: &str,
        visibility_window: Duration,
    ) -> Result<Option<QueueMessage>, StoreError> {
        let span = Span::current();

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            span.record("attempts", attempt);
            let now = self.clock.now();

            let candidate = sqlx::query(
                r#"
                SELECT id, version
                  FROM job_queue_messages
                 WHERE queue_name = $1 AND visible_after <= $2
                 ORDER BY enqueued_at ASC, id ASC
                 LIMIT 1
                "#,
            )
            .bind(queue)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("poll_next_select", e))?;

            let Some(candidate) = candidate else {
                return Ok(None);
            };
            let id: Uuid = candidate
                .try_get("id")
                .map_err(|e| StoreError::corrupt_row("poll_next", e))?;
            let seen_version: i64 = candidate
                .try_get("version")
                .map_err(|e| StoreError::corrupt_row("poll_next", e))?;

            let claimed = sqlx::query(&format!(
                r#"
                UPDATE job_queue_messages
                   SET visible_after = $3,
                       dequeue_count = dequeue_count + 1,
                       version = version + 1
                 WHERE id = $1 AND version = $2
                RETURNING {MESSAGE_COLUMNS}
                "#
            ))
            .bind(id)
            .bind(seen_version)
            .bind(add_duration(now, visibility_window))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("poll_next_claim", e))?;

            match claimed {
                Some(row) => {
                    span.record("message_id", tracing::field::display(id));
                    return decode_message(&row, "poll_next").map(Some);
                }
                None => debug!(queue, message_id = %id, attempt, "lost claim race, retrying"),
            }
        }

        Ok(None)
    }

    #[instrument(skip(self), fields(message_id = %id), err)]
    async fn complete(&self, id: MessageId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_queue_messages WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(message_id = %id), err)]
    async fn get(&self, id: MessageId) -> Result<Option<QueueMessage>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM job_queue_messages WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_message", e))?;

        row.map(|row| decode_message(&row, "get_message")).transpose()
    }

    #[instrument(skip(self), err)]
    async fn depth(&self, queue: &str) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM job_queue_messages WHERE queue_name = $1")
            .bind(queue)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("depth", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| StoreError::corrupt_row("depth", e))?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    #[instrument(skip(self, message), fields(message_id = %message.id, queue = %message.queue_name), err)]
    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO job_dead_letters
                (id, queue_name, payload, enqueued_at, dequeue_count, reason, dead_lettered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(&message.queue_name)
        .bind(&message.payload)
        .bind(message.enqueued_at)
        .bind(i32::try_from(message.dequeue_count).unwrap_or(i32::MAX))
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_insert", e))?;

        sqlx::query("DELETE FROM job_queue_messages WHERE id = $1")
            .bind(message.id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("dead_letter_delete", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue_name, payload, enqueued_at, dequeue_count, reason, dead_lettered_at
              FROM job_dead_letters
             WHERE queue_name = $1
             ORDER BY dead_lettered_at DESC, id DESC
             LIMIT $2
            "#,
        )
        .bind(queue)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| {
                DeadLetterRow::from_row(row)
                    .map(DeadLetterEntry::from)
                    .map_err(|e| StoreError::corrupt_row("list_dead_letters", e))
            })
            .collect()
    }
}

fn decode_message(row: &PgRow, operation: &str) -> Result<QueueMessage, StoreError> {
    MessageRow::from_row(row)
        .map(QueueMessage::from)
        .map_err(|e| StoreError::corrupt_row(operation, e))
}

struct MessageRow {
    id: Uuid,
    queue_name: String,
    payload: Value,
    enqueued_at: DateTime<Utc>,
    visible_after: DateTime<Utc>,
    dequeue_count: i32,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for MessageRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            payload: row.try_get("payload")?,
            enqueued_at: row.try_get("enqueued_at")?,
            visible_after: row.try_get("visible_after")?,
            dequeue_count: row.try_get("dequeue_count")?,
            version: row.try_get("version")?,
        })
    }
}

impl From<MessageRow> for QueueMessage {
    fn from(row: MessageRow) -> Self {
        Self {
            id: MessageId::from_uuid(row.id),
            queue_name: row.queue_name,
            payload: row.payload,
            enqueued_at: row.enqueued_at,
            visible_after: row.visible_after,
            dequeue_count: u32::try_from(row.dequeue_count).unwrap_or(0),
            version: u64::try_from(row.version).unwrap_or(0),
        }
    }
}

struct DeadLetterRow {
    id: Uuid,
    queue_name: String,
    payload: Value,
    enqueued_at: DateTime<Utc>,
    dequeue_count: i32,
    reason: String,
    dead_lettered_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for DeadLetterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            payload: row.try_get("payload")?,
            enqueued_at: row.try_get("enqueued_at")?,
            dequeue_count: row.try_get("dequeue_count")?,
            reason: row.try_get("reason")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
        })
    }
}

impl From<DeadLetterRow> for DeadLetterEntry {
    fn from(row: DeadLetterRow) -> Self {
        Self {
            message: QueueMessage {
                id: MessageId::from_uuid(row.id),
                queue_name: row.queue_name,
                payload: row.payload,
                enqueued_at: row.enqueued_at,
                visible_after: row.dead_lettered_at,
                dequeue_count: u32::try_from(row.dequeue_count).unwrap_or(0),
                version: 0,
            },
            reason: row.reason,
            dead_lettered_at: row.dead_lettered_at,
        }
    }
}
