//! Standalone worker process: one job host against the shared store.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;

use jobhost_core::{Clock, SystemClock, TaskId};
use jobhost_handlers::{HandlerFactory, JobContext, JobHandler, ServiceRegistry};
use jobhost_infra::schema::ensure_schema;
use jobhost_infra::{database_url_from_env, HostConfig, HostStores, JobHost, TaskRegistration};

#[derive(Debug, Default, Serialize, Deserialize)]
struct HeartbeatState {
    beats: u64,
}

/// Built-in liveness task: logs once a minute and counts its own runs.
#[derive(Clone)]
struct Heartbeat;

#[async_trait]
impl JobHandler for Heartbeat {
    type WorkItem = Option<HeartbeatState>;

    async fn process(&self, state: Option<HeartbeatState>, ctx: &JobContext) -> anyhow::Result<()> {
        let beats = state.unwrap_or_default().beats + 1;
        tracing::info!(worker_id = %ctx.worker_id(), beats, "heartbeat");
        ctx.save_state(&HeartbeatState { beats })?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobhost_observability::init();

    let config = HostConfig::from_env();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let stores = match database_url_from_env() {
        Ok(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(&url).await?;
            ensure_schema(&pool).await?;
            HostStores::postgres(pool, clock.clone())
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores (single process only)");
            HostStores::in_memory(clock.clone())
        }
    };

    let mut host = JobHost::new(config, stores, Arc::new(ServiceRegistry::new())).with_clock(clock);
    host.register_task(
        TaskRegistration::new(TaskId::new("worker-heartbeat")?, "* * * * *")
            .with_group("system")
            .with_description("worker liveness heartbeat"),
        HandlerFactory::shared(Heartbeat),
    )?;

    let handle = host.start().await?;
    tracing::info!(worker_id = %handle.worker_id(), "worker running; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    let stats = handle.shutdown().await;
    tracing::info!(?stats, "worker stopped");
    Ok(())
}
