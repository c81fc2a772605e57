//! Database entities.

pub mod publish_queue;

pub use publish_queue::Entity as PublishQueue;
