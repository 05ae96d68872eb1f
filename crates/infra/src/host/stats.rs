//! Host runtime statistics.

use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Host runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    /// Claimed messages handled (invoked or dead-lettered).
    pub messages_processed: u64,
    pub messages_completed: u64,
    pub messages_failed: u64,
    pub messages_dead_lettered: u64,
    pub task_runs_succeeded: u64,
    pub task_runs_faulted: u64,
    /// Runs whose outcome was discarded because the task lease was lost and
    /// another run took over.
    pub task_runs_superseded: u64,
    /// Due tasks skipped because another worker held the lease or won the start.
    pub lease_contention_skips: u64,
    pub storage_faults: u64,
    pub current_in_flight: usize,
}

/// Shared, lock-protected stats.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedStats(Arc<Mutex<HostStats>>);

impl SharedStats {
    pub(crate) fn update(&self, f: impl FnOnce(&mut HostStats)) {
        let mut stats = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    pub(crate) fn snapshot(&self) -> HostStats {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Count one in-flight invocation until the guard drops.
    pub(crate) fn in_flight(&self) -> InFlightGuard {
        self.update(|s| s.current_in_flight += 1);
        InFlightGuard(self.clone())
    }
}

pub(crate) struct InFlightGuard(SharedStats);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0
            .update(|s| s.current_in_flight = s.current_in_flight.saturating_sub(1));
    }
}
