//! Shared state for batch runs and subscriber workers.

use std::sync::Arc;

use courier_common::{IdGenerator, TransmitConfig};

use crate::lock::DistributedLock;
use crate::registry::TransmitterRegistry;
use crate::retry::RetryPolicy;
use crate::store::QueueStore;
use crate::task_queue::TaskQueue;

/// Everything a worker needs; cheap to clone.
#[derive(Clone)]
pub struct TransmitContext {
    /// Durable queue items.
    pub store: Arc<dyn QueueStore>,
    /// Batch and subscriber locks.
    pub locks: Arc<dyn DistributedLock>,
    /// Transmitters by delivery type.
    pub transmitters: Arc<TransmitterRegistry>,
    /// Where subscriber jobs are enqueued.
    pub tasks: Arc<dyn TaskQueue>,
    /// Pipeline settings.
    pub config: TransmitConfig,
    /// Derived from `config`.
    pub retry: RetryPolicy,
    /// Source of lock holder tokens.
    pub id_gen: IdGenerator,
}

impl TransmitContext {
    /// Assemble a context; the retry policy is derived from `config`.
    #[must_use]
    pub fn new(
        store: Arc<dyn QueueStore>,
        locks: Arc<dyn DistributedLock>,
        transmitters: Arc<TransmitterRegistry>,
        tasks: Arc<dyn TaskQueue>,
        config: TransmitConfig,
    ) -> Self {
        Self {
            store,
            locks,
            transmitters,
            tasks,
            retry: RetryPolicy::from_config(&config),
            config,
            id_gen: IdGenerator::new(),
        }
    }

    /// Fresh lock token for one acquisition.
    #[must_use]
    pub fn lock_token(&self) -> String {
        self.id_gen.generate_token()
    }
}
