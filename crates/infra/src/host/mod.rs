//! Job dispatcher.
//!
//! A `JobHost` owns one poll loop per registered queue and one schedule loop.
//! Loops never fail: storage faults are logged and retried on the next tick,
//! handler faults are recorded and logged at the invocation boundary.

mod invoke;
mod queue_worker;
mod schedule_worker;
mod stats;

pub use stats::HostStats;

use std::sync::Arc;

use sqlx::PgPool;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use jobhost_core::{Clock, SystemClock, TaskId, WorkerId};
use jobhost_handlers::{HandlerFactory, HandlerRegistry, JobHandler, RegistryError, ServiceResolver};

use crate::config::{ConfigError, HostConfig, QueueRegistration, TaskRegistration};
use crate::error::StoreError;
use crate::lease::{InMemoryLeaseStore, LeaseStore, PostgresLeaseStore};
use crate::queue::{InMemoryQueueStore, PostgresQueueStore, QueueStore};
use crate::schedule::{
    CronSchedule, InMemoryScheduledTaskStore, NewScheduledTask, PostgresScheduledTaskStore,
    ScheduleError, ScheduledTaskStore,
};
use crate::trigger::TriggerEngine;

use stats::SharedStats;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("task '{task_id}': {source}")]
    Schedule {
        task_id: TaskId,
        #[source]
        source: ScheduleError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The three stores a host coordinates through.
#[derive(Clone)]
pub struct HostStores {
    pub leases: Arc<dyn LeaseStore>,
    pub queues: Arc<dyn QueueStore>,
    pub tasks: Arc<dyn ScheduledTaskStore>,
}

impl HostStores {
    /// In-memory stores sharing one lease table.
    ///
    /// Hosts built from clones of the same `HostStores` behave like a fleet
    /// sharing one database.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        let leases = Arc::new(InMemoryLeaseStore::with_clock(clock.clone()));
        Self {
            leases: leases.clone(),
            queues: Arc::new(InMemoryQueueStore::with_clock(clock)),
            tasks: Arc::new(InMemoryScheduledTaskStore::new(leases)),
        }
    }

    pub fn postgres(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::new(PostgresLeaseStore::with_clock(pool.clone(), clock.clone())),
            queues: Arc::new(PostgresQueueStore::with_clock(pool.clone(), clock)),
            tasks: Arc::new(PostgresScheduledTaskStore::new(pool)),
        }
    }
}

impl core::fmt::Debug for HostStores {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostStores").finish_non_exhaustive()
    }
}

pub(crate) fn queue_key(queue: &str) -> String {
    format!("queue:{queue}")
}

pub(crate) fn task_key(id: &TaskId) -> String {
    format!("task:{id}")
}

/// State shared by the loops and invocations of one running host.
pub(crate) struct HostShared {
    pub(crate) config: HostConfig,
    pub(crate) stores: HostStores,
    pub(crate) registry: HandlerRegistry,
    pub(crate) services: Arc<dyn ServiceResolver>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) stats: SharedStats,
    pub(crate) token: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

struct RegisteredTask {
    registration: TaskRegistration,
    handler_type: &'static str,
}

/// Background job host.
///
/// Register queue consumers and scheduled tasks, then `start()`.
pub struct JobHost {
    config: HostConfig,
    stores: HostStores,
    services: Arc<dyn ServiceResolver>,
    clock: Arc<dyn Clock>,
    registry: HandlerRegistry,
    queues: Vec<QueueRegistration>,
    tasks: Vec<RegisteredTask>,
}

impl JobHost {
    pub fn new(config: HostConfig, stores: HostStores, services: Arc<dyn ServiceResolver>) -> Self {
        Self {
            config,
            stores,
            services,
            clock: Arc::new(SystemClock),
            registry: HandlerRegistry::new(),
            queues: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn worker_id(&self) -> WorkerId {
        self.config.worker_id
    }

    /// Consume `registration.queue_name` with handlers built by `factory`.
    pub fn register_queue<H: JobHandler>(
        &mut self,
        registration: QueueRegistration,
        factory: HandlerFactory<H>,
    ) -> Result<(), HostError> {
        registration.validate()?;
        self.registry
            .register(queue_key(&registration.queue_name), factory)?;
        self.queues.push(registration);
        Ok(())
    }

    /// Run handlers built by `factory` on `registration.schedule`.
    pub fn register_task<H: JobHandler>(
        &mut self,
        registration: TaskRegistration,
        factory: HandlerFactory<H>,
    ) -> Result<(), HostError> {
        CronSchedule::parse(&registration.schedule).map_err(|source| HostError::Schedule {
            task_id: registration.task_id.clone(),
            source,
        })?;
        self.registry.register(task_key(&registration.task_id), factory)?;
        self.tasks.push(RegisteredTask {
            registration,
            handler_type: std::any::type_name::<H>(),
        });
        Ok(())
    }

    /// Upsert registered tasks into the store and spawn the loops.
    pub async fn start(self) -> Result<JobHostHandle, HostError> {
        self.config.validate()?;
        let trigger = Arc::new(TriggerEngine::new(
            self.stores.tasks.clone(),
            self.clock.clone(),
        ));

        for task in &self.tasks {
            let reg = &task.registration;
            let next_execution = trigger
                .initial_next_execution(&reg.schedule)
                .map_err(|source| HostError::Schedule {
                    task_id: reg.task_id.clone(),
                    source,
                })?;
            let stored = self
                .stores
                .tasks
                .register(NewScheduledTask {
                    id: reg.task_id.clone(),
                    group: reg.group.clone(),
                    description: reg.description.clone(),
                    task_type: task.handler_type.to_string(),
                    schedule: reg.schedule.clone(),
                    next_execution,
                    initial_state: reg.initial_state.clone(),
                })
                .await?;
            info!(
                task_id = %stored.id,
                schedule = %stored.schedule,
                next_execution = ?stored.next_execution,
                "scheduled task registered"
            );
        }

        let token = CancellationToken::new();
        let stats = SharedStats::default();
        let shared = Arc::new(HostShared {
            config: self.config,
            stores: self.stores,
            registry: self.registry,
            services: self.services,
            clock: self.clock,
            stats: stats.clone(),
            token: token.clone(),
            tracker: TaskTracker::new(),
        });

        let mut loops = Vec::with_capacity(self.queues.len() + 1);
        for registration in self.queues {
            loops.push(tokio::spawn(queue_worker::run_queue_loop(
                shared.clone(),
                registration,
            )));
        }
        if !self.tasks.is_empty() {
            loops.push(tokio::spawn(schedule_worker::run_schedule_loop(
                shared.clone(),
                trigger,
            )));
        }

        info!(
            worker_id = %shared.config.worker_id,
            loops = loops.len(),
            "job host started"
        );

        Ok(JobHostHandle {
            worker_id: shared.config.worker_id,
            shutdown_grace: shared.config.shutdown_grace,
            token,
            tracker: shared.tracker.clone(),
            loops,
            stats,
        })
    }
}

impl core::fmt::Debug for JobHost {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobHost")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Handle to a running host.
#[derive(Debug)]
pub struct JobHostHandle {
    worker_id: WorkerId,
    shutdown_grace: std::time::Duration,
    token: CancellationToken,
    tracker: TaskTracker,
    loops: Vec<JoinHandle<()>>,
    stats: SharedStats,
}

impl JobHostHandle {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Current statistics.
    pub fn stats(&self) -> HostStats {
        self.stats.snapshot()
    }

    /// Stop polling, signal in-flight handlers and wait up to the shutdown
    /// grace period for them. Returns the final statistics.
    pub async fn shutdown(self) -> HostStats {
        info!(worker_id = %self.worker_id, "job host shutting down");
        self.token.cancel();

        for handle in self.loops {
            let _ = handle.await;
        }

        self.tracker.close();
        if timeout(self.shutdown_grace, self.tracker.wait()).await.is_err() {
            warn!(
                worker_id = %self.worker_id,
                in_flight = self.tracker.len(),
                "shutdown grace elapsed with handlers still running"
            );
        }

        info!(worker_id = %self.worker_id, "job host stopped");
        self.stats.snapshot()
    }
}
