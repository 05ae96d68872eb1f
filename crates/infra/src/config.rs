//! Host configuration.
//!
//! Everything the host needs is passed in explicitly. `HostConfig::from_env`
//! is a convenience for binaries; unset or malformed variables fall back to
//! the defaults with a warning.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use jobhost_core::{TaskId, WorkerId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable {0} is not set")]
    MissingVar(&'static str),
}

/// Process-wide host settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Lease owner token of this process.
    pub worker_id: WorkerId,
    /// How often the schedule loop looks for due tasks.
    #[serde(with = "duration_ms")]
    pub schedule_poll_interval: Duration,
    /// Lease duration held while a scheduled task runs (renewed every third).
    #[serde(with = "duration_ms")]
    pub task_lease: Duration,
    /// Upper bound on a single handler invocation.
    #[serde(with = "duration_ms")]
    pub handler_timeout: Duration,
    /// How long `shutdown` waits for in-flight handlers.
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new(),
            schedule_poll_interval: Duration::from_secs(1),
            task_lease: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl HostConfig {
    pub const ENV_WORKER_ID: &'static str = "JOBHOST_WORKER_ID";
    pub const ENV_SCHEDULE_POLL_MS: &'static str = "JOBHOST_SCHEDULE_POLL_MS";
    pub const ENV_TASK_LEASE_SECS: &'static str = "JOBHOST_TASK_LEASE_SECS";
    pub const ENV_HANDLER_TIMEOUT_SECS: &'static str = "JOBHOST_HANDLER_TIMEOUT_SECS";
    pub const ENV_SHUTDOWN_GRACE_SECS: &'static str = "JOBHOST_SHUTDOWN_GRACE_SECS";

    /// Read `JOBHOST_*` variables on top of the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            worker_id: parsed(&lookup, Self::ENV_WORKER_ID, defaults.worker_id),
            schedule_poll_interval: Duration::from_millis(parsed(
                &lookup,
                Self::ENV_SCHEDULE_POLL_MS,
                defaults.schedule_poll_interval.as_millis() as u64,
            )),
            task_lease: Duration::from_secs(parsed(
                &lookup,
                Self::ENV_TASK_LEASE_SECS,
                defaults.task_lease.as_secs(),
            )),
            handler_timeout: Duration::from_secs(parsed(
                &lookup,
                Self::ENV_HANDLER_TIMEOUT_SECS,
                defaults.handler_timeout.as_secs(),
            )),
            shutdown_grace: Duration::from_secs(parsed(
                &lookup,
                Self::ENV_SHUTDOWN_GRACE_SECS,
                defaults.shutdown_grace.as_secs(),
            )),
        }
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_schedule_poll_interval(mut self, interval: Duration) -> Self {
        self.schedule_poll_interval = interval;
        self
    }

    pub fn with_task_lease(mut self, lease: Duration) -> Self {
        self.task_lease = lease;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "schedule_poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.task_lease < Duration::from_secs(1) {
            return Err(ConfigError::Invalid(
                "task_lease must be at least one second".to_string(),
            ));
        }
        if self.handler_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "handler_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connection string for the Postgres stores.
pub fn database_url_from_env() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingVar("DATABASE_URL"))
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + core::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(var = key, value = %raw, default = %default, "invalid value, using default");
            default
        }),
    }
}

/// A queue consumer.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueRegistration {
    pub queue_name: String,
    /// Concurrent invocations for this queue within one host.
    #[serde(default = "QueueRegistration::default_instance_count")]
    pub instance_count: usize,
    #[serde(default = "QueueRegistration::default_polling_interval", with = "duration_ms")]
    pub polling_interval: Duration,
    /// How long a claimed message stays hidden.
    #[serde(default = "QueueRegistration::default_visibility_window", with = "duration_ms")]
    pub visibility_window: Duration,
    /// Dead-letter messages claimed more often than this. `None` disables it.
    #[serde(default)]
    pub max_dequeue_count: Option<u32>,
}

impl QueueRegistration {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            instance_count: Self::default_instance_count(),
            polling_interval: Self::default_polling_interval(),
            visibility_window: Self::default_visibility_window(),
            max_dequeue_count: None,
        }
    }

    fn default_instance_count() -> usize {
        1
    }

    fn default_polling_interval() -> Duration {
        Duration::from_secs(1)
    }

    fn default_visibility_window() -> Duration {
        Duration::from_secs(60)
    }

    pub fn with_instance_count(mut self, count: usize) -> Self {
        self.instance_count = count;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_visibility_window(mut self, window: Duration) -> Self {
        self.visibility_window = window;
        self
    }

    pub fn with_max_dequeue_count(mut self, max: u32) -> Self {
        self.max_dequeue_count = Some(max);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid("queue name must not be empty".to_string()));
        }
        if self.instance_count == 0 {
            return Err(ConfigError::Invalid(format!(
                "queue '{}': instance_count must be at least 1",
                self.queue_name
            )));
        }
        if self.polling_interval.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "queue '{}': polling_interval must be greater than zero",
                self.queue_name
            )));
        }
        Ok(())
    }
}

/// A cron-triggered task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRegistration {
    pub task_id: TaskId,
    pub schedule: String,
    #[serde(default = "TaskRegistration::default_group")]
    pub group: String,
    #[serde(default)]
    pub description: String,
    /// State handed to the very first run.
    #[serde(default)]
    pub initial_state: Option<Value>,
}

impl TaskRegistration {
    pub fn new(task_id: TaskId, schedule: impl Into<String>) -> Self {
        Self {
            task_id,
            schedule: schedule.into(),
            group: Self::default_group(),
            description: String::new(),
            initial_state: None,
        }
    }

    fn default_group() -> String {
        "default".to_string()
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_initial_state(mut self, state: Value) -> Self {
        self.initial_state = Some(state);
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_and_falls_back() {
        let worker = WorkerId::new();
        let vars: HashMap<&str, String> = HashMap::from([
            (HostConfig::ENV_WORKER_ID, worker.to_string()),
            (HostConfig::ENV_SCHEDULE_POLL_MS, "250".to_string()),
            (HostConfig::ENV_TASK_LEASE_SECS, "not-a-number".to_string()),
        ]);

        let config = HostConfig::from_lookup(|k| vars.get(k).cloned());
        assert_eq!(config.worker_id, worker);
        assert_eq!(config.schedule_poll_interval, Duration::from_millis(250));
        assert_eq!(config.task_lease, Duration::from_secs(60));
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn queue_registration_deserializes_with_defaults() {
        let reg: QueueRegistration = serde_json::from_value(serde_json::json!({
            "queue_name": "emails",
            "visibility_window": 5000,
            "max_dequeue_count": 3
        }))
        .unwrap();

        assert_eq!(reg.instance_count, 1);
        assert_eq!(reg.polling_interval, Duration::from_secs(1));
        assert_eq!(reg.visibility_window, Duration::from_secs(5));
        assert_eq!(reg.max_dequeue_count, Some(3));
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn invalid_registrations_are_rejected() {
        assert!(QueueRegistration::new("").validate().is_err());
        assert!(QueueRegistration::new("q").with_instance_count(0).validate().is_err());
        assert!(HostConfig::default()
            .with_schedule_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
    }
}
