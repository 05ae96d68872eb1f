use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::context::JobContext;

/// Processes one work item (handler abstraction).
///
/// A handler is a plain type whose dependencies arrive through its constructor
/// (see [`crate::HandlerFactory`]); it knows nothing about leases, visibility
/// windows or polling.
///
/// ## Work items
///
/// - **Queue handlers**: `WorkItem` is the deserialized message body.
/// - **Scheduled handlers**: `WorkItem` is the task's stored state. A task that
///   has never saved state hands the handler JSON `null`, so scheduled handlers
///   usually declare `Option<T>` or `()`. New state is written back with
///   [`JobContext::save_state`].
///
/// ## Failure
///
/// Returning `Err` marks the invocation failed. For queue work the message is
/// not completed and becomes visible again after its visibility window; for
/// scheduled work the run is recorded as faulted and the next occurrence is
/// still computed. Handlers should be idempotent (at-least-once delivery).
///
/// ## Cancellation
///
/// Long-running handlers should watch [`JobContext::cancelled`]; on host
/// shutdown or timeout the token fires and the result of the invocation is
/// discarded.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type WorkItem: DeserializeOwned + Send + 'static;

    async fn process(&self, item: Self::WorkItem, ctx: &JobContext) -> anyhow::Result<()>;
}
