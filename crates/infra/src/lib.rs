//! `jobhost-infra`: stores, triggers and the dispatcher.
//!
//! Every store comes as a trait with an in-memory implementation (tests,
//! single-process use) and a Postgres implementation (fleet use). All
//! cross-process coordination is expressed as conditional row writes; there
//! is no broker and no coordinator process.

pub mod config;
pub mod error;
pub mod host;
pub mod lease;
pub mod queue;
pub mod schedule;
pub mod schema;
pub mod trigger;

pub use config::{database_url_from_env, ConfigError, HostConfig, QueueRegistration, TaskRegistration};
pub use error::StoreError;
pub use host::{HostError, HostStats, HostStores, JobHost, JobHostHandle};
pub use lease::{InMemoryLeaseStore, Lease, LeaseStore, PostgresLeaseStore};
pub use queue::{DeadLetterEntry, InMemoryQueueStore, PostgresQueueStore, QueueMessage, QueueStore};
pub use schedule::{
    task_lease_name, CronSchedule, InMemoryScheduledTaskStore, NewScheduledTask,
    PostgresScheduledTaskStore, ScheduleError, ScheduledTask, ScheduledTaskStore, TaskRun,
    TaskStatus,
};
pub use trigger::{PollOutcome, QueuePollTrigger, TriggerEngine};

#[cfg(test)]
mod integration_tests;
