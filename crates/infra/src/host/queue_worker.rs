//! Per-queue poll loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use jobhost_handlers::WorkKind;

use super::invoke::invoke;
use super::{queue_key, HostShared};
use crate::config::QueueRegistration;
use crate::queue::QueueMessage;
use crate::trigger::{PollOutcome, QueuePollTrigger};

pub(crate) async fn run_queue_loop(shared: Arc<HostShared>, registration: QueueRegistration) {
    let registration = Arc::new(registration);
    let queue = registration.queue_name.as_str();
    let permits = Arc::new(Semaphore::new(registration.instance_count));
    let trigger = QueuePollTrigger::new(registration.polling_interval);

    info!(
        queue,
        worker_id = %shared.config.worker_id,
        instance_count = registration.instance_count,
        "queue loop started"
    );

    loop {
        // Only poll when an instance slot is free, so claimed messages never
        // wait out their visibility window in a local backlog.
        let permit = tokio::select! {
            _ = shared.token.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let outcome = match shared
            .stores
            .queues
            .poll_next(queue, registration.visibility_window)
            .await
        {
            Ok(Some(message)) => {
                debug!(
                    queue,
                    message_id = %message.id,
                    dequeue_count = message.dequeue_count,
                    "claimed message"
                );
                let task_shared = shared.clone();
                let task_registration = registration.clone();
                shared.tracker.spawn(async move {
                    handle_message(&task_shared, &task_registration, message).await;
                    drop(permit);
                });
                PollOutcome::Claimed
            }
            Ok(None) => PollOutcome::Empty,
            Err(e) => {
                error!(queue, error = %e, "failed to poll queue");
                shared.stats.update(|s| s.storage_faults += 1);
                PollOutcome::Fault
            }
        };

        let delay = trigger.next_delay(outcome);
        if !delay.is_zero() {
            tokio::select! {
                _ = shared.token.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
    }

    info!(queue, worker_id = %shared.config.worker_id, "queue loop stopped");
}

async fn handle_message(
    shared: &Arc<HostShared>,
    registration: &QueueRegistration,
    message: QueueMessage,
) {
    let _in_flight = shared.stats.in_flight();
    let queue = registration.queue_name.as_str();
    shared.stats.update(|s| s.messages_processed += 1);

    if let Some(max) = registration.max_dequeue_count {
        if message.dequeue_count > max {
            let reason = format!(
                "dequeue count {} exceeds maximum of {}",
                message.dequeue_count, max
            );
            match shared.stores.queues.dead_letter(&message, &reason).await {
                Ok(()) => {
                    warn!(queue, message_id = %message.id, %reason, "message dead-lettered");
                    shared.stats.update(|s| s.messages_dead_lettered += 1);
                }
                Err(e) => {
                    error!(queue, message_id = %message.id, error = %e, "failed to dead-letter message");
                    shared.stats.update(|s| s.storage_faults += 1);
                }
            }
            return;
        }
    }

    // The handler must stop before the claim lapses and another poller can
    // take the message.
    let claim_left = (message.visible_after - shared.clock.now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    if claim_left.is_zero() {
        warn!(queue, message_id = %message.id, "claim lapsed before invocation, message left for redelivery");
        shared.stats.update(|s| s.messages_failed += 1);
        return;
    }
    let limit = shared.config.handler_timeout.min(claim_left);

    let kind = WorkKind::Queue {
        queue: queue.to_string(),
        message_id: message.id,
        dequeue_count: message.dequeue_count,
    };
    let (result, _ctx) = invoke(
        shared,
        queue_key(queue),
        Some(message.payload),
        kind,
        limit,
        &shared.token,
    )
    .await;

    match result {
        Ok(()) => match shared.stores.queues.complete(message.id).await {
            Ok(()) => {
                debug!(queue, message_id = %message.id, "message completed");
                shared.stats.update(|s| s.messages_completed += 1);
            }
            Err(e) => {
                // Processed but still stored: it will be delivered again.
                error!(queue, message_id = %message.id, error = %e, "failed to complete message");
                shared.stats.update(|s| s.storage_faults += 1);
            }
        },
        Err(e) => {
            warn!(
                queue,
                message_id = %message.id,
                dequeue_count = message.dequeue_count,
                error = %e,
                "handler failed, message left for redelivery"
            );
            shared.stats.update(|s| s.messages_failed += 1);
        }
    }
}
