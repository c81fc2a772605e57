//! Dispatch scheduler.
//!
//! Every process may run one; the global batch lock keeps at most one batch
//! run active across the fleet.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::jobs::TransmitBatchJob;
use crate::task_queue::TaskQueue;

/// Shortest tick accepted; a zero period would panic the ticker.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Periodically requests batch runs.
#[derive(Clone)]
pub struct DispatchScheduler {
    tasks: Arc<dyn TaskQueue>,
    interval: Duration,
    delivery_type: Option<String>,
}

impl DispatchScheduler {
    /// Create a scheduler requesting a batch run every `interval`.
    ///
    /// Intervals shorter than 100ms are raised to 100ms.
    #[must_use]
    pub fn new(tasks: Arc<dyn TaskQueue>, interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            warn!(?interval, "Schedule interval too short, using 100ms");
        }
        Self {
            tasks,
            interval: interval.max(MIN_INTERVAL),
            delivery_type: None,
        }
    }

    /// Restrict triggered runs to one delivery type.
    #[must_use]
    pub fn with_delivery_type(mut self, delivery_type: Option<String>) -> Self {
        self.delivery_type = delivery_type;
        self
    }

    /// Request one batch run. Submission errors are logged, never returned.
    pub async fn trigger(&self) {
        let job = TransmitBatchJob::new(self.delivery_type.clone());
        match self.tasks.enqueue_batch(job).await {
            Ok(()) => debug!("Requested batch run"),
            Err(e) => error!(error = %e, "Failed to request batch run"),
        }
    }

    /// Trigger on every tick until the returned task is aborted.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        info!(interval_secs = self.interval.as_secs(), "Dispatch scheduler starting");

        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.trigger().await;
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::task_queue::{LocalTaskQueue, TransmitTask};

    #[tokio::test]
    async fn test_trigger_enqueues_batch() {
        let (queue, mut receiver) = LocalTaskQueue::channel(4);
        let scheduler = DispatchScheduler::new(Arc::new(queue), Duration::from_secs(10))
            .with_delivery_type(Some("ftp".to_string()));

        scheduler.trigger().await;

        match receiver.recv().await.unwrap() {
            TransmitTask::Batch(job) => assert_eq!(job.delivery_type.as_deref(), Some("ftp")),
            TransmitTask::Subscriber(_) => panic!("expected a batch request"),
        }
    }

    #[tokio::test]
    async fn test_trigger_swallows_full_queue() {
        let (queue, _receiver) = LocalTaskQueue::channel(1);
        let scheduler = DispatchScheduler::new(Arc::new(queue), Duration::from_secs(10));

        scheduler.trigger().await;
        scheduler.trigger().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_ticks() {
        let (queue, mut receiver) = LocalTaskQueue::channel(16);
        let handle = DispatchScheduler::new(Arc::new(queue), Duration::from_secs(10)).spawn();

        // First tick fires immediately, the next after one interval.
        receiver.recv().await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        receiver.recv().await.unwrap();

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_still_ticks() {
        let (queue, mut receiver) = LocalTaskQueue::channel(16);
        let handle = DispatchScheduler::new(Arc::new(queue), Duration::ZERO).spawn();

        receiver.recv().await.unwrap();
        tokio::time::advance(MIN_INTERVAL).await;
        receiver.recv().await.unwrap();

        assert!(!handle.is_finished());
        handle.abort();
    }
}
