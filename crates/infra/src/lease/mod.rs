//! Distributed lease store.
//!
//! A lease is a named, time-bounded mutual-exclusion claim stored as one row
//! per name. Acquisition is a single conditional write against the store, so
//! any number of worker processes can race on the same name and at most one
//! holds an unexpired lease at any instant.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryLeaseStore;
pub use postgres::PostgresLeaseStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobhost_core::WorkerId;

use crate::error::StoreError;

/// A named mutual-exclusion claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub owner: WorkerId,
    pub acquired_at: DateTime<Utc>,
    pub duration: Duration,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Expired leases are reclaimable by anyone.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, owner: WorkerId, now: DateTime<Utc>) -> bool {
        self.owner == owner && !self.is_expired(now)
    }
}

/// Lease persistence.
///
/// Losing a race is not an error: `try_acquire` and `renew` report it as
/// `Ok(false)` and callers wait for their next poll cycle.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claim `name` for `owner` if it is free or its current lease has expired.
    async fn try_acquire(
        &self,
        name: &str,
        owner: WorkerId,
        duration: Duration,
    ) -> Result<bool, StoreError>;

    /// Extend the lease by `duration` from now. Only the current, unexpired
    /// owner may renew.
    async fn renew(&self, name: &str, owner: WorkerId, duration: Duration)
    -> Result<bool, StoreError>;

    /// Drop the lease if `owner` holds it. No-op otherwise.
    async fn release(&self, name: &str, owner: WorkerId) -> Result<(), StoreError>;

    async fn get(&self, name: &str) -> Result<Option<Lease>, StoreError>;
}

pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidArgument(
            "lease name must not be empty".to_string(),
        ));
    }
    Ok(())
}
