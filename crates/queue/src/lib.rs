//! Publish transmission pipeline for courier.
//!
//! - **Lock**: named, expiring mutual exclusion (Redis or in-memory)
//! - **Store**: queue item selection and single-item state updates
//! - **Registry**: delivery type to transmitter lookup
//! - **Jobs / Workers**: batch runs and per-subscriber transmission
//! - **Task queue**: apalis Redis storages or an in-process executor
//! - **Scheduler**: periodic batch run requests
//! - **Retry**: fixed-delay retry budget per item

pub mod context;
pub mod jobs;
pub mod lock;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod task_queue;
pub mod transmitters;
pub mod workers;

/// A queue item as stored.
pub type QueueItem = courier_db::entities::publish_queue::Model;

pub use context::TransmitContext;
pub use jobs::*;
pub use lock::{BATCH_LOCK_NAME, DistributedLock, InMemoryLock, RedisLock, subscriber_lock_name};
pub use registry::{RegistryError, TransmitError, Transmitter, TransmitterRegistry};
pub use retry::RetryPolicy;
pub use scheduler::DispatchScheduler;
pub use store::{InMemoryQueueStore, QueueStore};
pub use task_queue::{
    ApalisTaskQueue, LocalTaskQueue, TaskQueue, TransmitTask, process_task, run_local_executor,
};
pub use transmitters::{HTTP_PUSH_DELIVERY_TYPE, HttpPushTransmitter};
pub use workers::*;
