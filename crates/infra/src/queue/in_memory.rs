//! In-memory queue store (dev/test, single process).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use jobhost_core::{add_duration, Clock, MessageId, SystemClock};

use super::{validate_queue_name, DeadLetterEntry, QueueMessage, QueueStore, MAX_CLAIM_ATTEMPTS};
use crate::error::StoreError;

/// In-memory queue store.
///
/// `poll_next` picks a candidate under the read lock and claims it under the
/// write lock only if its version is unchanged, the same optimistic protocol
/// the Postgres store runs.
#[derive(Debug)]
pub struct InMemoryQueueStore {
    clock: Arc<dyn Clock>,
    messages: RwLock<HashMap<MessageId, QueueMessage>>,
    dead_letters: RwLock<Vec<DeadLetterEntry>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            messages: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(Vec::new()),
        }
    }

    fn new_message(&self, queue: &str, payload: Value, delay: Duration) -> QueueMessage {
        let now = self.clock.now();
        QueueMessage {
            id: MessageId::new(),
            queue_name: queue.to_string(),
            payload,
            enqueued_at: now,
            visible_after: add_duration(now, delay),
            dequeue_count: 0,
            version: 0,
        }
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(
        &self,
        queue: &str,
        payload: Value,
        visibility_delay: Duration,
    ) -> Result<MessageId, StoreError> {
        validate_queue_name(queue)?;
        let message = self.new_message(queue, payload, visibility_delay);
        let id = message.id;
        let mut messages = self.messages.write().map_err(|_| StoreError::poisoned())?;
        messages.insert(id, message);
        Ok(id)
    }

    async fn enqueue_batch(
        &self,
        queue: &str,
        payloads: Vec<Value>,
        visibility_delay: Duration,
    ) -> Result<Vec<MessageId>, StoreError> {
        validate_queue_name(queue)?;
        let batch: Vec<QueueMessage> = payloads
            .into_iter()
            .map(|p| self.new_message(queue, p, visibility_delay))
            .collect();

        let mut messages = self.messages.write().map_err(|_| StoreError::poisoned())?;
        let ids = batch.iter().map(|m| m.id).collect();
        messages.extend(batch.into_iter().map(|m| (m.id, m)));
        Ok(ids)
    }

    async fn poll_next(
        &self,
        queue: &str,
        visibility_window: Duration,
    ) -> Result<Option<QueueMessage>, StoreError> {
        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let now = self.clock.now();

            let candidate = {
                let messages = self.messages.read().map_err(|_| StoreError::poisoned())?;
                messages
                    .values()
                    .filter(|m| m.queue_name == queue && m.is_visible(now))
                    .min_by_key(|m| (m.enqueued_at, m.id))
                    .map(|m| (m.id, m.version))
            };
            let Some((id, seen_version)) = candidate else {
                return Ok(None);
            };

            let mut messages = self.messages.write().map_err(|_| StoreError::poisoned())?;
            match messages.get_mut(&id) {
                Some(m) if m.version == seen_version => {
                    m.visible_after = add_duration(now, visibility_window);
                    m.dequeue_count = m.dequeue_count.saturating_add(1);
                    m.version += 1;
                    return Ok(Some(m.clone()));
                }
                _ => {
                    debug!(queue, message_id = %id, attempt, "lost claim race, retrying");
                }
            }
        }
        Ok(None)
    }

    async fn complete(&self, id: MessageId) -> Result<(), StoreError> {
        let mut messages = self.messages.write().map_err(|_| StoreError::poisoned())?;
        messages.remove(&id);
        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Option<QueueMessage>, StoreError> {
        let messages = self.messages.read().map_err(|_| StoreError::poisoned())?;
        Ok(messages.get(&id).cloned())
    }

    async fn depth(&self, queue: &str) -> Result<u64, StoreError> {
        let messages = self.messages.read().map_err(|_| StoreError::poisoned())?;
        Ok(messages.values().filter(|m| m.queue_name == queue).count() as u64)
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut messages = self.messages.write().map_err(|_| StoreError::poisoned())?;
        let mut dead_letters = self.dead_letters.write().map_err(|_| StoreError::poisoned())?;

        messages.remove(&message.id);
        if !dead_letters.iter().any(|d| d.message.id == message.id) {
            dead_letters.push(DeadLetterEntry {
                message: message.clone(),
                reason: reason.to_string(),
                dead_lettered_at: now,
            });
        }
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let dead_letters = self.dead_letters.read().map_err(|_| StoreError::poisoned())?;
        Ok(dead_letters
            .iter()
            .rev()
            .filter(|d| d.message.queue_name == queue)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use jobhost_core::ManualClock;
    use serde_json::json;
    use std::collections::HashSet;

    const WINDOW: Duration = Duration::from_secs(60);

    fn store() -> (Arc<ManualClock>, InMemoryQueueStore) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        (clock.clone(), InMemoryQueueStore::with_clock(clock))
    }

    #[tokio::test]
    async fn oldest_visible_message_is_claimed_first() {
        let (clock, store) = store();
        let first = store.enqueue("emails", json!(1), Duration::ZERO).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let second = store.enqueue("emails", json!(2), Duration::ZERO).await.unwrap();
        store.enqueue("sms", json!(3), Duration::ZERO).await.unwrap();

        let a = store.poll_next("emails", WINDOW).await.unwrap().unwrap();
        let b = store.poll_next("emails", WINDOW).await.unwrap().unwrap();
        assert_eq!((a.id, b.id), (first, second));
        assert!(store.poll_next("emails", WINDOW).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_message_is_hidden_until_due() {
        let (clock, store) = store();
        store.enqueue("emails", json!({}), Duration::from_secs(30)).await.unwrap();

        assert!(store.poll_next("emails", WINDOW).await.unwrap().is_none());
        clock.advance(Duration::from_secs(30));
        assert!(store.poll_next("emails", WINDOW).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn uncompleted_message_is_redelivered_after_window() {
        let (clock, store) = store();
        let id = store.enqueue("emails", json!({"to": "a"}), Duration::ZERO).await.unwrap();

        let claimed = store.poll_next("emails", WINDOW).await.unwrap().unwrap();
        assert_eq!((claimed.id, claimed.dequeue_count), (id, 1));

        clock.advance(Duration::from_secs(59));
        assert!(store.poll_next("emails", WINDOW).await.unwrap().is_none());

        clock.advance(Duration::from_secs(2));
        let again = store.poll_next("emails", WINDOW).await.unwrap().unwrap();
        assert_eq!((again.id, again.dequeue_count), (id, 2));
        assert_eq!(again.version, claimed.version + 1);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let (_clock, store) = store();
        let id = store.enqueue("emails", json!({}), Duration::ZERO).await.unwrap();

        store.complete(id).await.unwrap();
        store.complete(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        assert_eq!(store.depth("emails").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_shares_one_delay_and_keeps_order() {
        let (_clock, store) = store();
        let ids = store
            .enqueue_batch("emails", vec![json!(1), json!(2), json!(3)], Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.depth("emails").await.unwrap(), 3);

        let mut claimed = Vec::new();
        while let Some(m) = store.poll_next("emails", WINDOW).await.unwrap() {
            claimed.push(m.id);
        }
        assert_eq!(claimed, ids);
    }

    #[tokio::test]
    async fn dead_letter_removes_message_and_records_reason() {
        let (_clock, store) = store();
        store.enqueue("emails", json!({"bad": true}), Duration::ZERO).await.unwrap();
        let msg = store.poll_next("emails", WINDOW).await.unwrap().unwrap();

        store.dead_letter(&msg, "dequeue count 4 exceeds 3").await.unwrap();
        store.dead_letter(&msg, "dequeue count 4 exceeds 3").await.unwrap();

        assert_eq!(store.depth("emails").await.unwrap(), 0);
        let dead = store.list_dead_letters("emails", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.id, msg.id);
        assert_eq!(dead[0].reason, "dequeue count 4 exceeds 3");
        assert!(store.list_dead_letters("sms", 10).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pollers_claim_each_message_once() {
        let store = Arc::new(InMemoryQueueStore::new());
        let payloads = (0..50).map(|i| json!(i)).collect();
        store.enqueue_batch("jobs", payloads, Duration::ZERO).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                let mut empty_polls = 0;
                while empty_polls < 3 {
                    match store.poll_next("jobs", WINDOW).await.unwrap() {
                        Some(m) => mine.push(m.id),
                        None => empty_polls += 1,
                    }
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.await.unwrap() {
                assert!(seen.insert(id), "message {id} claimed twice");
            }
        }
        // Pollers may give up under contention; whatever is left is still claimable once.
        while let Some(m) = store.poll_next("jobs", WINDOW).await.unwrap() {
            assert!(seen.insert(m.id), "message {} claimed twice", m.id);
        }
        assert_eq!(seen.len(), 50);
    }
}
