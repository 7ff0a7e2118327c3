//! Transport seam between the session manager and a concrete broker client.

use async_trait::async_trait;
use std::sync::Arc;

use super::error::BrokerError;
use super::types::{BrokerEndpoint, LinkEvents, MessageHandler};

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Connects to `endpoint`. Later failures of this connection are sent
    /// to `events` tagged with `generation`.
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        generation: u64,
        events: LinkEvents,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a channel. Its failures are reported tagged with `generation`.
    async fn open_channel(
        &self,
        generation: u64,
        events: LinkEvents,
    ) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Maximum unacknowledged deliveries across the channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Declares a durable topic exchange.
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Declares a durable queue.
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Starts consuming `queue` with explicit acknowledgement. Every delivery
    /// is passed to `handler` on its own task.
    async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>)
        -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}
