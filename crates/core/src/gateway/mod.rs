//! Delivery of record batches to the downstream metrics gateway.

mod client;
mod error;
mod traits;

pub use client::GatewayClient;
pub use error::GatewayError;
pub use traits::MetricsSink;
