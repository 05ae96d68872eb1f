//! Store error model and SQLx error mapping.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Concurrent insert of the same key |
//! | Database (serialization failure) | `40001` | `Conflict` | Transaction lost a serialization race |
//! | Database (check/not-null violation) | `23514` / `23502` | `InvalidArgument` | Invalid row data |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Storage` | Connectivity loss |
//! | Other | N/A | `Storage` | Anything else |

use thiserror::Error;

/// Store operation error.
///
/// Claim contention is *not* an error: lease and queue claims report it as
/// `false` / `None`. What remains are storage faults that callers surface or,
/// in the host loops, log and retry on the next tick.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub(crate) fn poisoned() -> Self {
        Self::Storage("lock poisoned".to_string())
    }

    pub(crate) fn corrupt_row(operation: &str, err: impl core::fmt::Display) -> Self {
        Self::Storage(format!("failed to decode row in {operation}: {err}"))
    }
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                // Unique violation / serialization failure
                Some("23505") | Some("40001") => StoreError::Conflict(msg),
                // Check constraint / not-null violation
                Some("23514") | Some("23502") => StoreError::InvalidArgument(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            // Queries use fetch_optional/fetch_all; this should not happen.
            StoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
