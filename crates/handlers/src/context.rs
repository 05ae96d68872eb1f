//! Per-invocation context handed to handlers.

use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use jobhost_core::{MessageId, TaskId, WorkerId};

/// What triggered the invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkKind {
    /// A claimed queue message.
    Queue {
        queue: String,
        message_id: MessageId,
        /// Number of times the message has been claimed, this claim included.
        dequeue_count: u32,
    },
    /// A due scheduled task.
    Scheduled {
        task_id: TaskId,
        /// Number of runs, this run included.
        execution_count: u64,
    },
}

/// Context for one handler invocation.
///
/// Carries the cancellation token tied to host shutdown and the handler's
/// bounded lifetime, plus write-back slots for task progress and state.
#[derive(Debug)]
pub struct JobContext {
    worker_id: WorkerId,
    kind: WorkKind,
    cancellation: CancellationToken,
    progress: Mutex<Option<Value>>,
    state: Mutex<Option<Value>>,
}

impl JobContext {
    pub fn new(worker_id: WorkerId, kind: WorkKind, cancellation: CancellationToken) -> Self {
        Self {
            worker_id,
            kind,
            cancellation,
            progress: Mutex::new(None),
            state: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn kind(&self) -> &WorkKind {
        &self.kind
    }

    /// Dequeue count of the message being processed (0 for scheduled work).
    pub fn dequeue_count(&self) -> u32 {
        match &self.kind {
            WorkKind::Queue { dequeue_count, .. } => *dequeue_count,
            WorkKind::Scheduled { .. } => 0,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the host shuts down or the invocation times out.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Record progress for a scheduled task run.
    ///
    /// Ignored for queue work.
    pub fn report_progress<T: Serialize>(&self, progress: &T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(progress)?;
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
        Ok(())
    }

    /// Replace the state carried into the next run of a scheduled task.
    ///
    /// Ignored for queue work.
    pub fn save_state<T: Serialize>(&self, state: &T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(state)?;
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
        Ok(())
    }

    pub fn take_progress(&self) -> Option<Value> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn take_state(&self) -> Option<Value> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
