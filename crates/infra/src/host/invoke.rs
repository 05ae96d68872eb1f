//! Invocation boundary: one handler run in its own task, bounded and isolated.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use jobhost_handlers::{JobContext, JobError, WorkKind};

use super::HostShared;

/// Run the handler registered under `key` for at most `limit`.
///
/// The handler's token is a child of `parent`, so cancelling `parent` reaches
/// the handler. Decode, construction and handler errors, timeouts and panics
/// all come back as `JobError`. On timeout the handler task is aborted and
/// awaited, so it has stopped when this returns. The context is returned so
/// the caller can collect progress and state written by the handler.
pub(crate) async fn invoke(
    shared: &Arc<HostShared>,
    key: String,
    payload: Option<Value>,
    kind: WorkKind,
    limit: Duration,
    parent: &CancellationToken,
) -> (Result<(), JobError>, Arc<JobContext>) {
    let token = parent.child_token();
    let ctx = Arc::new(JobContext::new(
        shared.config.worker_id,
        kind,
        token.clone(),
    ));

    let task_shared = shared.clone();
    let task_ctx = ctx.clone();
    let mut handle = tokio::spawn(async move {
        task_shared
            .registry
            .invoke(&key, payload.as_ref(), &*task_shared.services, &task_ctx)
            .await
    });

    let result = match timeout(limit, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => {
            Err(JobError::Panicked(panic_message(join_err.into_panic())))
        }
        Ok(Err(_)) => Err(JobError::Cancelled),
        Err(_) => {
            token.cancel();
            handle.abort();
            let _ = handle.await;
            Err(JobError::TimedOut(limit))
        }
    };

    (result, ctx)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
