//! Stuck item reconciliation.
//!
//! A worker that dies between `in-progress` and its next write leaves the
//! item stranded, since selection never picks `in-progress` items. When
//! enabled, batch runs move such items back to `retrying`, due immediately.
//! The retry count is left alone: the interrupted attempt never reported.

use chrono::{DateTime, Duration, Utc};
use courier_common::{AppError, AppResult};
use tracing::{debug, info};

use crate::store::QueueStore;

/// Reset items `in-progress` for longer than `threshold`. Returns how many moved.
pub async fn reset_stuck_items(
    store: &dyn QueueStore,
    threshold: Duration,
    now: DateTime<Utc>,
    limit: u64,
) -> AppResult<u64> {
    let started_before = now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let stuck = store.find_stuck_in_progress(started_before, limit).await?;
    let mut reset = 0;

    for item in stuck {
        match store.reset_stuck_to_retrying(&item.id, now).await {
            Ok(()) => {
                info!(
                    queue_item_id = %item.id,
                    subscriber_id = %item.subscriber_id,
                    transmit_started_at = ?item.transmit_started_at,
                    "Reset stuck item to retrying"
                );
                reset += 1;
            }
            // Settled by its worker in the meantime.
            Err(AppError::Conflict(_) | AppError::NotFound(_)) => {
                debug!(queue_item_id = %item.id, "Stuck item already moved on");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(reset)
}
