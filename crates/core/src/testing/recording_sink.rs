//! Metrics sink that records batches instead of sending them.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::gateway::{GatewayError, MetricsSink};
use crate::work::{ProcessingMetadata, Record};

/// A batch handed to the sink.
#[derive(Debug, Clone)]
pub struct RecordedBatch {
    pub metadata: ProcessingMetadata,
    pub records: Vec<Record>,
    /// Whether the sink accepted it.
    pub accepted: bool,
}

/// Records every batch. Can be told to reject batches from a given call on.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    batches: Arc<RwLock<Vec<RecordedBatch>>>,
    /// Calls at or beyond this index are rejected.
    fail_from: Arc<RwLock<Option<usize>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every batch.
    pub fn failing() -> Self {
        Self {
            fail_from: Arc::new(RwLock::new(Some(0))),
            ..Self::default()
        }
    }

    /// Accepts the first `count` batches, rejects the rest.
    pub async fn fail_after(&self, count: usize) {
        *self.fail_from.write().await = Some(count);
    }

    pub async fn batches(&self) -> Vec<RecordedBatch> {
        self.batches.read().await.clone()
    }

    /// Records of accepted batches, one inner vector per batch.
    pub async fn accepted(&self) -> Vec<Vec<Record>> {
        self.batches
            .read()
            .await
            .iter()
            .filter(|b| b.accepted)
            .map(|b| b.records.clone())
            .collect()
    }

    pub async fn calls(&self) -> usize {
        self.batches.read().await.len()
    }
}

#[async_trait]
impl MetricsSink for RecordingSink {
    async fn send(&self, metadata: &ProcessingMetadata, batch: &[Record]) -> Result<(), GatewayError> {
        let mut batches = self.batches.write().await;
        let accepted = match *self.fail_from.read().await {
            Some(limit) => batches.len() < limit,
            None => true,
        };
        batches.push(RecordedBatch {
            metadata: metadata.clone(),
            records: batch.to_vec(),
            accepted,
        });

        if accepted {
            Ok(())
        } else {
            Err(GatewayError::Rejected {
                status: 503,
                body: "gateway unavailable".to_string(),
            })
        }
    }
}
