//! Trigger engine: when is work due?
//!
//! `TriggerEngine` answers the schedule side (due tasks, next cron
//! occurrences); `QueuePollTrigger` answers the queue side (how long to wait
//! before the next poll).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use jobhost_core::Clock;

use crate::error::StoreError;
use crate::schedule::{CronSchedule, ScheduleError, ScheduledTask, ScheduledTaskStore};

/// Computes due scheduled tasks and their next occurrences.
///
/// Parsed cron schedules are cached by expression.
pub struct TriggerEngine {
    store: Arc<dyn ScheduledTaskStore>,
    clock: Arc<dyn Clock>,
    schedules: Mutex<HashMap<String, CronSchedule>>,
}

impl TriggerEngine {
    pub fn new(store: Arc<dyn ScheduledTaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            schedules: Mutex::new(HashMap::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Tasks the store considers due right now.
    pub async fn due_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        self.store.get_due(self.clock.now()).await
    }

    /// Parse (or fetch from cache) a cron expression.
    pub fn schedule(&self, expression: &str) -> Result<CronSchedule, ScheduleError> {
        let mut cache = self.schedules.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(schedule) = cache.get(expression) {
            return Ok(schedule.clone());
        }
        let schedule = CronSchedule::parse(expression)?;
        cache.insert(expression.to_string(), schedule.clone());
        Ok(schedule)
    }

    /// Next occurrence of `task`'s schedule strictly after `from`.
    pub fn next_occurrence(
        &self,
        task: &ScheduledTask,
        from: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        Ok(self.schedule(&task.schedule)?.next_after(from))
    }

    /// First due time for a freshly registered schedule.
    pub fn initial_next_execution(
        &self,
        expression: &str,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        Ok(self.schedule(expression)?.next_after(self.clock.now()))
    }
}

impl core::fmt::Debug for TriggerEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TriggerEngine")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Result of one queue poll, as seen by the poll cadence.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A message was claimed; more may be waiting.
    Claimed,
    Empty,
    /// The store failed; treat as a failed cycle.
    Fault,
}

/// Poll cadence of one queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QueuePollTrigger {
    polling_interval: Duration,
}

impl QueuePollTrigger {
    pub fn new(polling_interval: Duration) -> Self {
        Self { polling_interval }
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// Delay before the next poll.
    pub fn next_delay(&self, outcome: PollOutcome) -> Duration {
        match outcome {
            PollOutcome::Claimed => Duration::ZERO,
            PollOutcome::Empty | PollOutcome::Fault => self.polling_interval,
        }
    }
}
