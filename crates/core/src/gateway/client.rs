//! HTTP client for the metrics gateway.

use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::error::GatewayError;
use super::traits::MetricsSink;
use crate::config::GatewayConfig;
use crate::metrics;
use crate::work::{ProcessingMetadata, Record};

/// Posts each batch as a JSON array to the gateway's event endpoint.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: Client,
    url: String,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let url = config.event_url().ok_or(GatewayError::NotConfigured)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MetricsSink for GatewayClient {
    async fn send(&self, metadata: &ProcessingMetadata, batch: &[Record]) -> Result<(), GatewayError> {
        let body = serde_json::to_string(batch).map_err(|e| GatewayError::Transport(e.to_string()))?;
        debug!(
            url = %self.url,
            records = batch.len(),
            "Sending batch: {}",
            body.chars().take(50).collect::<String>()
        );
        trace!("Batch body: {}", body);

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(token) = &metadata.access_token {
            request = request.bearer_auth(token);
        }

        let started = Instant::now();
        let result = match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Err(GatewayError::Rejected {
                    status,
                    body: body.chars().take(200).collect(),
                })
            }
            Err(e) if e.is_timeout() => Err(GatewayError::Timeout),
            Err(e) if e.is_connect() => Err(GatewayError::ConnectionFailed(e.to_string())),
            Err(e) => Err(GatewayError::Transport(e.to_string())),
        };

        let label = match &result {
            Ok(()) => "success",
            Err(e) => e.label(),
        };
        metrics::BATCHES_SENT.with_label_values(&[label]).inc();
        metrics::BATCH_SEND_DURATION
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());

        result
    }
}
