//! Job definitions.

mod transmit_batch;
mod transmit_subscriber;

pub use transmit_batch::TransmitBatchJob;
pub use transmit_subscriber::TransmitSubscriberJob;
