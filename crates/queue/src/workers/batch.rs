//! Batch run worker.
//!
//! Selects due items under the global lock and hands each subscriber's
//! items to its own subscriber job. Subscriber jobs are not awaited.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use apalis::prelude::*;
use chrono::Utc;
use courier_common::AppResult;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::{panic_message, release_lock};
use crate::QueueItem;
use crate::context::TransmitContext;
use crate::jobs::{TransmitBatchJob, TransmitSubscriberJob};
use crate::lock::BATCH_LOCK_NAME;
use crate::reconcile::reset_stuck_items;

/// How a batch run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The request was older than the trigger expiry.
    Expired,
    /// Another run holds the global lock.
    LockHeld,
    /// Selection ran and subscriber jobs were enqueued.
    Completed {
        /// Items selected.
        selected: usize,
        /// Distinct subscribers among them.
        subscribers: usize,
        /// Subscriber jobs that could not be enqueued.
        enqueue_failures: usize,
    },
    /// Abandoned at the soft time limit.
    TimedOut,
    /// Lock or store error, or a panic.
    Failed(String),
}

/// Group items by subscriber, keeping selection order within and across groups.
#[must_use]
pub fn partition_by_subscriber(items: Vec<QueueItem>) -> Vec<(String, Vec<QueueItem>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut partitions: Vec<(String, Vec<QueueItem>)> = Vec::new();

    for item in items {
        match index.get(&item.subscriber_id) {
            Some(&slot) => partitions[slot].1.push(item),
            None => {
                index.insert(item.subscriber_id.clone(), partitions.len());
                partitions.push((item.subscriber_id.clone(), vec![item]));
            }
        }
    }

    partitions
}

/// Run one batch: lock, select, partition, enqueue, release.
pub async fn run_batch(ctx: &TransmitContext, job: &TransmitBatchJob) -> BatchOutcome {
    if job.is_expired(Utc::now(), ctx.config.trigger_expiry()) {
        debug!(requested_at = %job.requested_at, "Dropping expired batch request");
        return BatchOutcome::Expired;
    }

    let token = ctx.lock_token();
    let expire = Duration::from_secs(ctx.config.batch_lock_expiry_secs);
    match ctx.locks.try_acquire(BATCH_LOCK_NAME, &token, expire).await {
        Ok(true) => {}
        Ok(false) => {
            info!(lock = BATCH_LOCK_NAME, "Batch run already in progress, skipping");
            return BatchOutcome::LockHeld;
        }
        Err(e) => {
            error!(lock = BATCH_LOCK_NAME, error = %e, "Failed to acquire batch lock");
            return BatchOutcome::Failed(e.to_string());
        }
    }

    let dispatch = AssertUnwindSafe(dispatch(ctx, job.delivery_type.as_deref())).catch_unwind();
    let outcome = match tokio::time::timeout(ctx.config.soft_time_limit(), dispatch).await {
        Ok(Ok(Ok(outcome))) => outcome,
        Ok(Ok(Err(e))) => {
            error!(error = %e, code = e.error_code(), "Batch run failed");
            BatchOutcome::Failed(e.to_string())
        }
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "Batch run panicked");
            BatchOutcome::Failed(message)
        }
        Err(_) => {
            warn!(
                limit_secs = ctx.config.task_soft_time_limit_secs,
                "Batch run hit its soft time limit"
            );
            BatchOutcome::TimedOut
        }
    };

    release_lock(ctx, BATCH_LOCK_NAME, &token).await;
    outcome
}

async fn dispatch(ctx: &TransmitContext, delivery_type: Option<&str>) -> AppResult<BatchOutcome> {
    let now = Utc::now();

    if ctx.config.reconcile_stuck_items {
        match reset_stuck_items(
            ctx.store.as_ref(),
            ctx.config.stuck_item_threshold(),
            now,
            ctx.config.max_transmit_query_limit,
        )
        .await
        {
            Ok(0) => {}
            Ok(count) => info!(count, "Reset stuck in-progress items"),
            Err(e) => warn!(error = %e, "Stuck item reconciliation failed"),
        }
    }

    let items = ctx
        .store
        .find_transmittable(now, ctx.config.max_transmit_query_limit, delivery_type)
        .await?;
    let selected = items.len();
    if selected == 0 {
        debug!("No items to transmit");
        return Ok(BatchOutcome::Completed {
            selected: 0,
            subscribers: 0,
            enqueue_failures: 0,
        });
    }

    let partitions = partition_by_subscriber(items);
    let subscribers = partitions.len();
    let mut enqueue_failures = 0;

    for (subscriber_id, items) in partitions {
        let count = items.len();
        let job = TransmitSubscriberJob::new(subscriber_id.clone(), items);

        match ctx.tasks.enqueue_subscriber(job).await {
            Ok(()) => debug!(subscriber_id = %subscriber_id, count, "Dispatched subscriber items"),
            Err(e) => {
                enqueue_failures += 1;
                error!(
                    subscriber_id = %subscriber_id,
                    count,
                    error = %e,
                    "Failed to dispatch subscriber items"
                );
            }
        }
    }

    info!(
        selected,
        subscribers,
        delivery_type = delivery_type.unwrap_or("*"),
        "Dispatched batch"
    );

    Ok(BatchOutcome::Completed {
        selected,
        subscribers,
        enqueue_failures,
    })
}

/// Apalis entry point for batch runs.
///
/// Always succeeds: failures are logged and the next tick selects again.
pub async fn transmit_batch_worker(
    job: TransmitBatchJob,
    ctx: Data<TransmitContext>,
) -> Result<(), Error> {
    let outcome = run_batch(&ctx, &job).await;
    debug!(?outcome, "Batch run finished");
    Ok(())
}
