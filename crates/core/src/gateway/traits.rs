use async_trait::async_trait;

use super::error::GatewayError;
use crate::work::{ProcessingMetadata, Record};

/// Destination for batches of records.
#[async_trait]
pub trait MetricsSink: Send + Sync + 'static {
    /// Delivers one batch. `metadata` carries the unit's bearer token.
    async fn send(&self, metadata: &ProcessingMetadata, batch: &[Record]) -> Result<(), GatewayError>;
}
