//! Schedule loop: finds due tasks and runs each under its task lease.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobhost_core::WorkerId;
use jobhost_handlers::WorkKind;

use super::invoke::invoke;
use super::{task_key, HostShared};
use crate::lease::LeaseStore;
use crate::schedule::{ScheduledTask, TaskRun};
use crate::trigger::TriggerEngine;

pub(crate) async fn run_schedule_loop(shared: Arc<HostShared>, trigger: Arc<TriggerEngine>) {
    let worker_id = shared.config.worker_id;
    let mut ticker = interval(shared.config.schedule_poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(%worker_id, "schedule loop started");

    loop {
        tokio::select! {
            _ = shared.token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let due = match trigger.due_tasks().await {
            Ok(due) => due,
            Err(e) => {
                error!(%worker_id, error = %e, "failed to load due tasks");
                shared.stats.update(|s| s.storage_faults += 1);
                continue;
            }
        };

        for task in due {
            // Tasks registered by other processes may have no handler here.
            if !shared.registry.contains(&task_key(&task.id)) {
                debug!(task_id = %task.id, "due task has no local handler");
                continue;
            }
            if shared.token.is_cancelled() {
                break;
            }
            let task_shared = shared.clone();
            let task_trigger = trigger.clone();
            shared
                .tracker
                .spawn(async move { run_task(task_shared, task_trigger, task).await });
        }
    }

    info!(%worker_id, "schedule loop stopped");
}

async fn run_task(shared: Arc<HostShared>, trigger: Arc<TriggerEngine>, task: ScheduledTask) {
    let worker_id = shared.config.worker_id;
    let lease_name = task.lease_name();
    let leases = shared.stores.leases.clone();
    let task_lease = shared.config.task_lease;

    match leases.try_acquire(&lease_name, worker_id, task_lease).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(task_id = %task.id, "task lease held elsewhere, skipping");
            shared.stats.update(|s| s.lease_contention_skips += 1);
            return;
        }
        Err(e) => {
            error!(task_id = %task.id, error = %e, "failed to acquire task lease");
            shared.stats.update(|s| s.storage_faults += 1);
            return;
        }
    }

    let started_at = shared.clock.now();
    match shared
        .stores
        .tasks
        .mark_started(&task.id, task.version, worker_id, started_at)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            debug!(task_id = %task.id, "task already started by another worker");
            shared.stats.update(|s| s.lease_contention_skips += 1);
            release(&*leases, &lease_name, worker_id).await;
            return;
        }
        Err(e) => {
            error!(task_id = %task.id, error = %e, "failed to mark task started");
            shared.stats.update(|s| s.storage_faults += 1);
            release(&*leases, &lease_name, worker_id).await;
            return;
        }
    }

    let _in_flight = shared.stats.in_flight();
    let run = TaskRun::started_from(&task, worker_id);
    info!(task_id = %task.id, %worker_id, "scheduled task started");

    // Cancelled when the host shuts down or the task lease is lost.
    let run_token = shared.token.child_token();
    let keep_alive_token = CancellationToken::new();
    let keep_alive = tokio::spawn(keep_alive(
        leases.clone(),
        lease_name.clone(),
        worker_id,
        task_lease,
        keep_alive_token.clone(),
        run_token.clone(),
    ));

    let kind = WorkKind::Scheduled {
        task_id: task.id.clone(),
        execution_count: run.execution_count,
    };
    let (result, ctx) = invoke(
        &shared,
        task_key(&task.id),
        task.state.clone(),
        kind,
        shared.config.handler_timeout,
        &run_token,
    )
    .await;

    keep_alive_token.cancel();
    let lease_lost = matches!(keep_alive.await, Ok(KeepAlive::Lost));

    let finished_at = shared.clock.now();
    let next_execution = match trigger.next_occurrence(&task, finished_at) {
        Ok(next) => next,
        Err(e) => {
            error!(task_id = %task.id, error = %e, "stored schedule no longer parses");
            None
        }
    };

    let recorded = match result {
        Ok(()) => {
            let state = ctx.take_state().or(task.state.clone());
            let recorded = shared
                .stores
                .tasks
                .mark_completed(&task.id, run, next_execution, ctx.take_progress(), state)
                .await;
            if let Ok(true) = recorded {
                info!(task_id = %task.id, next_execution = ?next_execution, "scheduled task succeeded");
                shared.stats.update(|s| s.task_runs_succeeded += 1);
            }
            recorded
        }
        Err(e) => {
            warn!(task_id = %task.id, error = %e, lease_lost, next_execution = ?next_execution, "scheduled task faulted");
            let recorded = shared
                .stores
                .tasks
                .mark_faulted(&task.id, run, &e.to_string(), next_execution, finished_at)
                .await;
            if let Ok(true) = recorded {
                shared.stats.update(|s| s.task_runs_faulted += 1);
            }
            recorded
        }
    };
    match recorded {
        Ok(true) => {}
        Ok(false) => {
            warn!(task_id = %task.id, %worker_id, "task was restarted elsewhere, outcome discarded");
            shared.stats.update(|s| s.task_runs_superseded += 1);
        }
        Err(e) => {
            error!(task_id = %task.id, error = %e, "failed to record task outcome");
            shared.stats.update(|s| s.storage_faults += 1);
        }
    }

    release(&*leases, &lease_name, worker_id).await;
}

enum KeepAlive {
    Stopped,
    Lost,
}

/// Renew the task lease every third of its duration until stopped.
///
/// A lost lease cancels `run`, so the handler stops working on a task that
/// may already be running elsewhere.
async fn keep_alive(
    leases: Arc<dyn LeaseStore>,
    lease_name: String,
    worker_id: WorkerId,
    task_lease: Duration,
    stop: CancellationToken,
    run: CancellationToken,
) -> KeepAlive {
    let period = task_lease / 3;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return KeepAlive::Stopped,
            _ = sleep(period) => {}
        }
        match leases.renew(&lease_name, worker_id, task_lease).await {
            Ok(true) => debug!(lease = %lease_name, "task lease renewed"),
            Ok(false) => {
                warn!(lease = %lease_name, "task lease lost while running, cancelling run");
                run.cancel();
                return KeepAlive::Lost;
            }
            Err(e) => warn!(lease = %lease_name, error = %e, "failed to renew task lease"),
        }
    }
}

async fn release(leases: &dyn LeaseStore, name: &str, worker_id: WorkerId) {
    if let Err(e) = leases.release(name, worker_id).await {
        warn!(lease = name, error = %e, "failed to release task lease");
    }
}
