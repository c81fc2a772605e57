//! Built-in transmitters.

mod http;

pub use http::{HTTP_PUSH_DELIVERY_TYPE, HttpPushTransmitter};
