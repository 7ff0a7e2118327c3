use std::sync::Arc;
use tracing::debug;

use super::error::BrokerError;
use super::traits::BrokerChannel;
use super::types::MessageHandler;
use crate::registry::ContentTypeKey;

/// Exchange plus one queue per content-type key, each bound with its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub keys: Vec<ContentTypeKey>,
}

impl Topology {
    pub fn new(exchange: impl Into<String>, mut keys: Vec<ContentTypeKey>) -> Self {
        keys.sort();
        keys.dedup();
        Self {
            exchange: exchange.into(),
            keys,
        }
    }

    /// Declares everything on `channel` and starts consuming.
    pub async fn apply(
        &self,
        channel: &dyn BrokerChannel,
        prefetch: u16,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        channel.set_prefetch(prefetch).await?;
        channel.declare_exchange(&self.exchange).await?;

        for key in &self.keys {
            let queue = key.as_str();
            channel.declare_queue(queue).await?;
            channel.bind_queue(queue, &self.exchange, queue).await?;
            channel.consume(queue, Arc::clone(&handler)).await?;
            debug!(queue, exchange = %self.exchange, "Consuming queue");
        }
        Ok(())
    }
}
