//! Per-subscriber transmission job.

use serde::{Deserialize, Serialize};

use crate::QueueItem;

/// Items of one subscriber, in transmission order, as read by the batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitSubscriberJob {
    /// Subscriber whose lock the worker takes.
    pub subscriber_id: String,
    /// Snapshot of the items, oldest first.
    pub items: Vec<QueueItem>,
}

impl TransmitSubscriberJob {
    /// Create a job for `subscriber_id`.
    #[must_use]
    pub const fn new(subscriber_id: String, items: Vec<QueueItem>) -> Self {
        Self {
            subscriber_id,
            items,
        }
    }
}
