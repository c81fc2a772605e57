//! Job workers.

mod batch;
mod subscriber;

use std::any::Any;

use tracing::{debug, error, warn};

use crate::context::TransmitContext;

pub use batch::{BatchOutcome, partition_by_subscriber, run_batch, transmit_batch_worker};
pub use subscriber::{
    ItemOutcome, SubscriberOutcome, SubscriberTally, transmit_subscriber_items,
    transmit_subscriber_worker,
};

/// Release `name` held with `token`; failures are only logged.
async fn release_lock(ctx: &TransmitContext, name: &str, token: &str) {
    match ctx.locks.release(name, token).await {
        Ok(true) => debug!(lock = %name, "Released lock"),
        Ok(false) => warn!(lock = %name, "Lock expired or was taken over before release"),
        Err(e) => error!(lock = %name, error = %e, "Failed to release lock"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
