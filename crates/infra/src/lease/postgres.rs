//! Postgres-backed lease store.
//!
//! Each operation is a single statement whose `WHERE` clause carries the
//! ownership/expiry condition, so the primary key on `job_leases.name` is the
//! only synchronization point. There is never a read followed by a write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use jobhost_core::{add_duration, Clock, SystemClock, WorkerId};

use super::{validate_name, Lease, LeaseStore};
use crate::error::{map_sqlx_error, StoreError};

/// Postgres-backed lease store over the `job_leases` table.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl PostgresLeaseStore {
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
impl LeaseStore for PostgresLeaseStore {
    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn try_acquire(
        &self,
        name: &str,
        owner: WorkerId,
        duration: Duration,
    ) -> Result<bool, StoreError> {
        validate_name(name)?;
        let now = self.clock.now();

        // The conflict branch only fires when the existing row has expired;
        // otherwise nothing is returned and the caller lost.
        let row = sqlx::query(
            r#"
            INSERT INTO job_leases (name, owner, acquired_at, duration_ms, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE
               SET owner = EXCLUDED.owner,
                   acquired_at = EXCLUDED.acquired_at,
                   duration_ms = EXCLUDED.duration_ms,
                   expires_at = EXCLUDED.expires_at
             WHERE job_leases.expires_at <= $3
            RETURNING name
            "#,
        )
        .bind(name)
        .bind(owner.as_uuid())
        .bind(now)
        .bind(duration_ms(duration))
        .bind(add_duration(now, duration))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_acquire", e))?;

        Ok(row.is_some())
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn renew(
        &self,
        name: &str,
        owner: WorkerId,
        duration: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();

        let result = sqlx::query(
            r#"
            UPDATE job_leases
               SET duration_ms = $3, expires_at = $4
             WHERE name = $1 AND owner = $2 AND expires_at > $5
            "#,
        )
        .bind(name)
        .bind(owner.as_uuid())
        .bind(duration_ms(duration))
        .bind(add_duration(now, duration))
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn release(&self, name: &str, owner: WorkerId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_leases WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, name: &str) -> Result<Option<Lease>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT name, owner, acquired_at, duration_ms, expires_at
              FROM job_leases
             WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_lease", e))?;

        row.map(|row| {
            LeaseRow::from_row(&row)
                .map(Lease::from)
                .map_err(|e| StoreError::corrupt_row("get_lease", e))
        })
        .transpose()
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

struct LeaseRow {
    name: String,
    owner: Uuid,
    acquired_at: DateTime<Utc>,
    duration_ms: i64,
    expires_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for LeaseRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            owner: row.try_get("owner")?,
            acquired_at: row.try_get("acquired_at")?,
            duration_ms: row.try_get("duration_ms")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Self {
            name: row.name,
            owner: WorkerId::from_uuid(row.owner),
            acquired_at: row.acquired_at,
            duration: Duration::from_millis(u64::try_from(row.duration_ms).unwrap_or(0)),
            expires_at: row.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::pg_pool;

    #[tokio::test]
    async fn conditional_upsert_excludes_second_owner() {
        let Some(pool) = pg_pool().await else {
            return;
        };
        let store = PostgresLeaseStore::new(pool);
        let name = format!("lease-test-{}", Uuid::now_v7());
        let a = WorkerId::new();
        let b = WorkerId::new();
        let minute = Duration::from_secs(60);

        assert!(store.try_acquire(&name, a, minute).await.unwrap());
        assert!(!store.try_acquire(&name, b, minute).await.unwrap());
        assert!(!store.renew(&name, b, minute).await.unwrap());
        assert!(store.renew(&name, a, minute).await.unwrap());

        store.release(&name, b).await.unwrap();
        assert_eq!(store.get(&name).await.unwrap().unwrap().owner, a);
        store.release(&name, a).await.unwrap();
        assert!(store.get(&name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_duration_lease_is_immediately_reclaimable() {
        let Some(pool) = pg_pool().await else {
            return;
        };
        let store = PostgresLeaseStore::new(pool);
        let name = format!("lease-test-{}", Uuid::now_v7());

        assert!(store.try_acquire(&name, WorkerId::new(), Duration::ZERO).await.unwrap());
        assert!(store
            .try_acquire(&name, WorkerId::new(), Duration::from_secs(60))
            .await
            .unwrap());
    }
}
