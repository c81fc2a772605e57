//! Transmitter registry.
//!
//! Maps a destination's `delivery_type` to the transmitter that delivers it.
//! Registration happens at startup; workers only read.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_db::entities::publish_queue::PULL_DELIVERY_TYPE;
use thiserror::Error;

use crate::QueueItem;

/// Error returned by a transmitter for one delivery attempt.
#[derive(Debug, Error)]
pub enum TransmitError {
    /// No transmitter serves the item's delivery type.
    #[error("No transmitter registered for delivery type {0}")]
    UnknownDeliveryType(String),

    /// Destination config is unusable.
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// The destination rejected the item.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// The transmitter panicked.
    #[error("Transmitter panicked: {0}")]
    Panicked(String),

    /// Transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Delivers one queue item to its destination.
///
/// Implementations may be called again for an item they already delivered
/// (a lock can expire under a slow worker), so delivery should be idempotent
/// per `(item_id, item_version, subscriber_id)` where the destination allows.
#[async_trait]
pub trait Transmitter: Send + Sync {
    /// Deliver `item` to `item.destination`.
    async fn transmit(&self, item: &QueueItem) -> Result<(), TransmitError>;
}

/// Registration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The delivery type is taken.
    #[error("Transmitter already registered for delivery type {0}")]
    AlreadyRegistered(String),

    /// The delivery type is never transmitted.
    #[error("Delivery type {0} is reserved for pull consumers")]
    Reserved(String),
}

/// Delivery type to transmitter lookup.
#[derive(Clone, Default)]
pub struct TransmitterRegistry {
    transmitters: HashMap<String, Arc<dyn Transmitter>>,
}

impl TransmitterRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transmitter` for `delivery_type`.
    ///
    /// # Errors
    /// Fails if the type is already taken or is the pull type.
    pub fn register(
        &mut self,
        delivery_type: impl Into<String>,
        transmitter: Arc<dyn Transmitter>,
    ) -> Result<(), RegistryError> {
        let delivery_type = delivery_type.into();
        if delivery_type == PULL_DELIVERY_TYPE {
            return Err(RegistryError::Reserved(delivery_type));
        }
        if self.transmitters.contains_key(&delivery_type) {
            return Err(RegistryError::AlreadyRegistered(delivery_type));
        }

        tracing::debug!(delivery_type = %delivery_type, "Registered transmitter");
        self.transmitters.insert(delivery_type, transmitter);
        Ok(())
    }

    /// Transmitter for `delivery_type`.
    ///
    /// # Errors
    /// Returns [`TransmitError::UnknownDeliveryType`] when nothing is registered.
    pub fn get(&self, delivery_type: &str) -> Result<Arc<dyn Transmitter>, TransmitError> {
        self.transmitters
            .get(delivery_type)
            .cloned()
            .ok_or_else(|| TransmitError::UnknownDeliveryType(delivery_type.to_string()))
    }

    /// Registered delivery types, sorted.
    #[must_use]
    pub fn delivery_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.transmitters.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered transmitters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transmitters.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transmitters.is_empty()
    }
}
