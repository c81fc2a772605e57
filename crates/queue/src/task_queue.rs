//! Task submission.
//!
//! Batch runs and subscriber jobs go through [`TaskQueue`]. Production uses
//! the apalis Redis storages; [`LocalTaskQueue`] runs everything in-process.

use std::sync::Arc;

use apalis::prelude::*;
use apalis_redis::RedisStorage;
use async_trait::async_trait;
use courier_common::{AppError, AppResult};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info};

use crate::context::TransmitContext;
use crate::jobs::{TransmitBatchJob, TransmitSubscriberJob};
use crate::workers::{run_batch, transmit_subscriber_items};

/// Asynchronous submission of transmission work.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Request a batch run.
    async fn enqueue_batch(&self, job: TransmitBatchJob) -> AppResult<()>;

    /// Hand a subscriber's items to a worker.
    async fn enqueue_subscriber(&self, job: TransmitSubscriberJob) -> AppResult<()>;
}

/// Work item of the in-process queue.
#[derive(Debug, Clone)]
pub enum TransmitTask {
    /// Run a batch.
    Batch(TransmitBatchJob),
    /// Transmit one subscriber's items.
    Subscriber(TransmitSubscriberJob),
}

/// Bounded in-process queue.
#[derive(Clone)]
pub struct LocalTaskQueue {
    sender: mpsc::Sender<TransmitTask>,
}

impl LocalTaskQueue {
    /// Create a queue holding at most `capacity` waiting tasks.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TransmitTask>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    fn submit(&self, task: TransmitTask) -> AppResult<()> {
        self.sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AppError::Queue("Task queue is full".to_string()),
            mpsc::error::TrySendError::Closed(_) => {
                AppError::Queue("Task queue is closed".to_string())
            }
        })
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn enqueue_batch(&self, job: TransmitBatchJob) -> AppResult<()> {
        self.submit(TransmitTask::Batch(job))
    }

    async fn enqueue_subscriber(&self, job: TransmitSubscriberJob) -> AppResult<()> {
        self.submit(TransmitTask::Subscriber(job))
    }
}

/// Run one task to completion.
pub async fn process_task(ctx: &TransmitContext, task: TransmitTask) {
    match task {
        TransmitTask::Batch(job) => {
            let outcome = run_batch(ctx, &job).await;
            debug!(?outcome, "Batch task finished");
        }
        TransmitTask::Subscriber(job) => {
            let outcome = transmit_subscriber_items(ctx, job).await;
            debug!(?outcome, "Subscriber task finished");
        }
    }
}

/// Drain `receiver`, running at most `executor_concurrency` tasks at once.
pub async fn run_local_executor(mut receiver: mpsc::Receiver<TransmitTask>, ctx: TransmitContext) {
    let semaphore = Arc::new(Semaphore::new(ctx.config.executor_concurrency.max(1)));
    info!(
        workers = ctx.config.executor_concurrency,
        "Local transmit executor starting"
    );

    while let Some(task) = receiver.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let _permit = permit;
            process_task(&ctx, task).await;
        });
    }

    info!("Local transmit executor stopped");
}

/// Queue backed by apalis Redis storages.
#[derive(Clone)]
pub struct ApalisTaskQueue {
    batches: RedisStorage<TransmitBatchJob>,
    subscribers: RedisStorage<TransmitSubscriberJob>,
}

impl ApalisTaskQueue {
    /// Push batch and subscriber jobs to their own storages.
    #[must_use]
    pub const fn new(
        batches: RedisStorage<TransmitBatchJob>,
        subscribers: RedisStorage<TransmitSubscriberJob>,
    ) -> Self {
        Self {
            batches,
            subscribers,
        }
    }
}

#[async_trait]
impl TaskQueue for ApalisTaskQueue {
    async fn enqueue_batch(&self, job: TransmitBatchJob) -> AppResult<()> {
        self.batches
            .clone()
            .push(job)
            .await
            .map_err(|e| AppError::Queue(format!("Failed to queue batch run: {e}")))?;
        debug!("Queued batch run");
        Ok(())
    }

    async fn enqueue_subscriber(&self, job: TransmitSubscriberJob) -> AppResult<()> {
        let subscriber_id = job.subscriber_id.clone();
        self.subscribers
            .clone()
            .push(job)
            .await
            .map_err(|e| AppError::Queue(format!("Failed to queue subscriber job: {e}")))?;
        debug!(subscriber_id = %subscriber_id, "Queued subscriber job");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_queue_full() {
        let (queue, mut receiver) = LocalTaskQueue::channel(1);

        queue.enqueue_batch(TransmitBatchJob::new(None)).await.unwrap();
        let result = queue.enqueue_batch(TransmitBatchJob::new(None)).await;
        assert!(matches!(result, Err(AppError::Queue(_))));

        assert!(matches!(receiver.recv().await, Some(TransmitTask::Batch(_))));
    }

    #[tokio::test]
    async fn test_local_queue_closed() {
        let (queue, receiver) = LocalTaskQueue::channel(4);
        drop(receiver);

        let result = queue
            .enqueue_subscriber(TransmitSubscriberJob::new("sub".to_string(), Vec::new()))
            .await;
        assert!(matches!(result, Err(AppError::Queue(msg)) if msg.contains("closed")));
    }
}
