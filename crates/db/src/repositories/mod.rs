//! Repositories.

mod publish_queue;

pub use publish_queue::{PublishQueueRepository, transmittable_query};
