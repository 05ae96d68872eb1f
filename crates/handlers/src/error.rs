//! Handler-side error model.

use thiserror::Error;

/// Failure to build a handler instance for a work item.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// A constructor dependency was not registered with the service resolver.
    #[error("missing service: {0}")]
    MissingService(&'static str),

    /// The constructor rejected the work item or its dependencies.
    #[error("handler construction failed: {0}")]
    Construction(String),
}

impl FactoryError {
    pub fn construction(msg: impl Into<String>) -> Self {
        Self::Construction(msg.into())
    }
}

/// Outcome of a failed handler invocation.
///
/// Every variant is a *handler fault*: the dispatcher records and logs it and
/// never lets it reach a poll loop.
#[derive(Debug, Error)]
pub enum JobError {
    /// No handler is registered under the dispatch key.
    #[error("no handler registered for '{0}'")]
    NoHandler(String),

    /// The payload did not decode into the handler's work item type.
    #[error("payload decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The handler factory failed.
    #[error(transparent)]
    Factory(#[from] FactoryError),

    /// The handler returned an error.
    #[error("handler failed: {0:#}")]
    Handler(#[source] anyhow::Error),

    /// The handler exceeded its allotted lifetime.
    #[error("handler timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler task was cancelled before it finished.
    #[error("handler cancelled")]
    Cancelled,
}

/// Handler registration failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate handler for '{0}'")]
    Duplicate(String),
}
