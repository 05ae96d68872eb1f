//! Core error model.

use thiserror::Error;

/// Core-level error.
///
/// Keep this focused on deterministic input failures (identifiers).
/// Storage and runtime failures belong to the crates that own them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure, empty task name).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
