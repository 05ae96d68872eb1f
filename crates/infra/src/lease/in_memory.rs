//! In-memory lease store (dev/test, single process).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobhost_core::{add_duration, Clock, SystemClock, WorkerId};

use super::{validate_name, Lease, LeaseStore};
use crate::error::StoreError;

/// In-memory lease store.
///
/// Every mutation happens under one write lock, which gives the same
/// compare-and-set semantics as the conditional upsert in Postgres.
#[derive(Debug)]
pub struct InMemoryLeaseStore {
    clock: Arc<dyn Clock>,
    leases: RwLock<HashMap<String, Lease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            leases: RwLock::new(HashMap::new()),
        }
    }

    /// Whether an unexpired lease exists for `name` at `now`.
    pub(crate) fn is_held(&self, name: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let leases = self.leases.read().map_err(|_| StoreError::poisoned())?;
        Ok(leases.get(name).is_some_and(|l| !l.is_expired(now)))
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        name: &str,
        owner: WorkerId,
        duration: Duration,
    ) -> Result<bool, StoreError> {
        validate_name(name)?;
        let now = self.clock.now();
        let mut leases = self.leases.write().map_err(|_| StoreError::poisoned())?;

        if let Some(existing) = leases.get(name) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }

        leases.insert(
            name.to_string(),
            Lease {
                name: name.to_string(),
                owner,
                acquired_at: now,
                duration,
                expires_at: add_duration(now, duration),
            },
        );
        Ok(true)
    }

    async fn renew(
        &self,
        name: &str,
        owner: WorkerId,
        duration: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut leases = self.leases.write().map_err(|_| StoreError::poisoned())?;

        match leases.get_mut(name) {
            Some(lease) if lease.is_held_by(owner, now) => {
                lease.duration = duration;
                lease.expires_at = add_duration(now, duration);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, owner: WorkerId) -> Result<(), StoreError> {
        let mut leases = self.leases.write().map_err(|_| StoreError::poisoned())?;
        if leases.get(name).is_some_and(|l| l.owner == owner) {
            leases.remove(name);
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Lease>, StoreError> {
        let leases = self.leases.read().map_err(|_| StoreError::poisoned())?;
        Ok(leases.get(name).cloned())
    }
}
