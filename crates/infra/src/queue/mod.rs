//! Durable message queue with visibility windows.
//!
//! Messages are claimed, not removed: a successful `poll_next` hides the
//! message for a visibility window and bumps its dequeue count. Only
//! `complete` deletes it. A worker that fails, hangs or crashes simply lets
//! the window lapse and the message is delivered again (at-least-once).

mod in_memory;
mod postgres;

pub use in_memory::InMemoryQueueStore;
pub use postgres::PostgresQueueStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobhost_core::MessageId;

use crate::error::StoreError;

/// Bound on optimistic claim retries within one `poll_next` call.
pub const MAX_CLAIM_ATTEMPTS: usize = 5;

/// A message stored in a named queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: MessageId,
    pub queue_name: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub visible_after: DateTime<Utc>,
    /// Number of claims so far.
    pub dequeue_count: u32,
    /// Optimistic concurrency token, bumped by every claim.
    pub version: u64,
}

impl QueueMessage {
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_after <= now
    }
}

/// A message quarantined by the poison-message policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: QueueMessage,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Queue persistence.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Add a message; it becomes visible after `visibility_delay`.
    async fn enqueue(
        &self,
        queue: &str,
        payload: Value,
        visibility_delay: Duration,
    ) -> Result<MessageId, StoreError>;

    /// Add several messages atomically, all with the same delay.
    async fn enqueue_batch(
        &self,
        queue: &str,
        payloads: Vec<Value>,
        visibility_delay: Duration,
    ) -> Result<Vec<MessageId>, StoreError>;

    /// Claim the oldest visible message of `queue` for `visibility_window`.
    ///
    /// Returns `None` when nothing is visible or when every claim attempt lost
    /// a race to another poller.
    async fn poll_next(
        &self,
        queue: &str,
        visibility_window: Duration,
    ) -> Result<Option<QueueMessage>, StoreError>;

    /// Delete a message. Completing an unknown id is a no-op.
    async fn complete(&self, id: MessageId) -> Result<(), StoreError>;

    async fn get(&self, id: MessageId) -> Result<Option<QueueMessage>, StoreError>;

    /// Number of stored messages in `queue`, claimed or not.
    async fn depth(&self, queue: &str) -> Result<u64, StoreError>;

    /// Move a message out of its queue into the dead-letter table.
    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), StoreError>;

    /// Most recent dead letters of `queue` first.
    async fn list_dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;
}

pub(crate) fn validate_queue_name(queue: &str) -> Result<(), StoreError> {
    if queue.trim().is_empty() {
        return Err(StoreError::InvalidArgument(
            "queue name must not be empty".to_string(),
        ));
    }
    Ok(())
}
