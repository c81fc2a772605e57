//! Subscriber worker.
//!
//! Transmits one subscriber's items strictly in order under the subscriber
//! lock. Every item is settled on its own; one bad item never stops the rest.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use apalis::prelude::*;
use chrono::Utc;
use courier_db::entities::publish_queue::QueueState;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::{panic_message, release_lock};
use crate::QueueItem;
use crate::context::TransmitContext;
use crate::jobs::TransmitSubscriberJob;
use crate::lock::subscriber_lock_name;
use crate::registry::TransmitError;

/// Result of one item's attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Delivered and recorded.
    Success,
    /// Failed; another attempt is scheduled.
    Retrying { retry_attempt: i32 },
    /// Failed with the retry budget exhausted.
    Failed,
    /// The resulting state could not be written.
    Unrecorded,
}

/// Counts of item outcomes for one subscriber job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberTally {
    /// Items delivered.
    pub success: usize,
    /// Items scheduled for another attempt.
    pub retrying: usize,
    /// Items out of attempts.
    pub failed: usize,
    /// Items whose resulting state could not be written.
    pub unrecorded: usize,
}

impl SubscriberTally {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Success => self.success += 1,
            ItemOutcome::Retrying { .. } => self.retrying += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Unrecorded => self.unrecorded += 1,
        }
    }

    /// Items handled in total.
    #[must_use]
    pub const fn attempted(&self) -> usize {
        self.success + self.retrying + self.failed + self.unrecorded
    }
}

/// How a subscriber job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberOutcome {
    /// Another worker holds the subscriber lock; nothing was touched.
    LockHeld,
    /// Every item was handled.
    Completed(SubscriberTally),
    /// Abandoned at the soft time limit.
    TimedOut,
    /// Lock error or a panic outside item handling.
    Failed(String),
}

/// Transmit every item of `job` under the subscriber lock.
pub async fn transmit_subscriber_items(
    ctx: &TransmitContext,
    job: TransmitSubscriberJob,
) -> SubscriberOutcome {
    let lock_name = subscriber_lock_name(&job.subscriber_id);
    let token = ctx.lock_token();
    let expire = Duration::from_secs(ctx.config.subscriber_lock_expiry_secs);

    match ctx.locks.try_acquire(&lock_name, &token, expire).await {
        Ok(true) => {}
        Ok(false) => {
            info!(
                subscriber_id = %job.subscriber_id,
                lock = %lock_name,
                "Subscriber is being transmitted by another worker, skipping"
            );
            return SubscriberOutcome::LockHeld;
        }
        Err(e) => {
            error!(
                subscriber_id = %job.subscriber_id,
                lock = %lock_name,
                error = %e,
                "Failed to acquire subscriber lock"
            );
            return SubscriberOutcome::Failed(e.to_string());
        }
    }

    let run = AssertUnwindSafe(transmit_in_order(ctx, &job.items)).catch_unwind();
    let outcome = match tokio::time::timeout(ctx.config.soft_time_limit(), run).await {
        Ok(Ok(tally)) => {
            info!(
                subscriber_id = %job.subscriber_id,
                success = tally.success,
                retrying = tally.retrying,
                failed = tally.failed,
                unrecorded = tally.unrecorded,
                "Subscriber items processed"
            );
            SubscriberOutcome::Completed(tally)
        }
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            error!(subscriber_id = %job.subscriber_id, panic = %message, "Subscriber worker panicked");
            SubscriberOutcome::Failed(message)
        }
        Err(_) => {
            warn!(
                subscriber_id = %job.subscriber_id,
                limit_secs = ctx.config.task_soft_time_limit_secs,
                "Subscriber worker hit its soft time limit"
            );
            SubscriberOutcome::TimedOut
        }
    };

    release_lock(ctx, &lock_name, &token).await;
    outcome
}

async fn transmit_in_order(ctx: &TransmitContext, items: &[QueueItem]) -> SubscriberTally {
    let mut tally = SubscriberTally::default();
    for item in items {
        tally.record(transmit_item(ctx, item).await);
    }
    tally
}

/// Attempt one item and write its resulting state.
async fn transmit_item(ctx: &TransmitContext, item: &QueueItem) -> ItemOutcome {
    if let Err(e) = ctx.store.mark_in_progress(&item.id, Utc::now()).await {
        error!(
            queue_item_id = %item.id,
            subscriber_id = %item.subscriber_id,
            error = %e,
            "Failed to mark item in progress"
        );
        return record_failure(ctx, item, &e.to_string()).await;
    }

    debug!(
        queue_item_id = %item.id,
        item_id = %item.item_id,
        item_version = item.item_version,
        subscriber_id = %item.subscriber_id,
        state = %QueueState::InProgress,
        "Transmitting item"
    );

    match deliver(ctx, item).await {
        Ok(()) => match ctx.store.mark_success(&item.id, Utc::now()).await {
            Ok(()) => {
                info!(
                    queue_item_id = %item.id,
                    item_id = %item.item_id,
                    item_version = item.item_version,
                    subscriber_id = %item.subscriber_id,
                    state = %QueueState::Success,
                    "Item transmitted"
                );
                ItemOutcome::Success
            }
            Err(e) => {
                error!(
                    queue_item_id = %item.id,
                    subscriber_id = %item.subscriber_id,
                    error = %e,
                    "Item transmitted but its success could not be recorded"
                );
                ItemOutcome::Unrecorded
            }
        },
        Err(e) => {
            warn!(
                queue_item_id = %item.id,
                item_id = %item.item_id,
                subscriber_id = %item.subscriber_id,
                delivery_type = %item.destination.delivery_type,
                error = %e,
                "Transmission failed"
            );
            record_failure(ctx, item, &e.to_string()).await
        }
    }
}

async fn deliver(ctx: &TransmitContext, item: &QueueItem) -> Result<(), TransmitError> {
    let transmitter = ctx.transmitters.get(&item.destination.delivery_type)?;

    AssertUnwindSafe(transmitter.transmit(item))
        .catch_unwind()
        .await
        .map_err(|panic| TransmitError::Panicked(panic_message(panic.as_ref())))?
}

/// Re-read the item and write the retry or failed state. Never retried.
async fn record_failure(ctx: &TransmitContext, item: &QueueItem, error: &str) -> ItemOutcome {
    let current = match ctx.store.find_by_id(&item.id).await {
        Ok(Some(current)) => current,
        Ok(None) => {
            error!(queue_item_id = %item.id, "Queue item vanished before its failure was recorded");
            return ItemOutcome::Unrecorded;
        }
        Err(e) => {
            error!(
                queue_item_id = %item.id,
                error = %e,
                "Failed to re-read item, failure not recorded"
            );
            return ItemOutcome::Unrecorded;
        }
    };

    let update = ctx.retry.failure_update(&current, error, Utc::now());
    let state = update.state;
    let retry_attempt = update.retry_attempt;
    let next_retry_attempt_at = update.next_retry_attempt_at;

    if let Err(e) = ctx.store.record_failure(&current, update).await {
        error!(
            queue_item_id = %item.id,
            subscriber_id = %item.subscriber_id,
            state = %current.state,
            error = %e,
            code = e.error_code(),
            "Failed to record transmission failure"
        );
        return ItemOutcome::Unrecorded;
    }

    if state == QueueState::Retrying {
        info!(
            queue_item_id = %item.id,
            subscriber_id = %item.subscriber_id,
            state = %state,
            retry_attempt,
            next_retry_attempt_at = ?next_retry_attempt_at,
            "Item scheduled for retry"
        );
        ItemOutcome::Retrying { retry_attempt }
    } else {
        error!(
            queue_item_id = %item.id,
            item_id = %item.item_id,
            subscriber_id = %item.subscriber_id,
            state = %state,
            retry_attempt,
            "Item failed, retries exhausted"
        );
        ItemOutcome::Failed
    }
}

/// Apalis entry point for subscriber jobs.
///
/// Always succeeds: item state carries the retry schedule, so apalis must not
/// replay the job.
pub async fn transmit_subscriber_worker(
    job: TransmitSubscriberJob,
    ctx: Data<TransmitContext>,
) -> Result<(), Error> {
    let subscriber_id = job.subscriber_id.clone();
    let outcome = transmit_subscriber_items(&ctx, job).await;
    debug!(subscriber_id = %subscriber_id, ?outcome, "Subscriber job finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally() {
        let mut tally = SubscriberTally::default();
        tally.record(ItemOutcome::Success);
        tally.record(ItemOutcome::Retrying { retry_attempt: 1 });
        tally.record(ItemOutcome::Success);
        tally.record(ItemOutcome::Unrecorded);

        assert_eq!(tally.success, 2);
        assert_eq!(tally.retrying, 1);
        assert_eq!(tally.unrecorded, 1);
        assert_eq!(tally.attempted(), 4);
    }
}
