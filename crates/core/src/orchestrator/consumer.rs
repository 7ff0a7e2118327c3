//! Message handler that runs processors and forwards their records.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::batch::Batch;
use super::resolution::{MessageOutcome, MessageResolution};
use crate::broker::{AckController, Delivery, MessageHandler};
use crate::gateway::{GatewayError, MetricsSink};
use crate::metrics;
use crate::registry::ProcessorRegistry;
use crate::runner::{dispatch, ProcessingError, ProcessingEvent, ProcessingHandle, ProcessorRunner};
use crate::work::{Record, UnitOfWork};

/// Binds registry, runner and gateway into a [`MessageHandler`].
pub struct ResultConsumer<R: ?Sized, S: ?Sized> {
    registry: Arc<ProcessorRegistry>,
    runner: Arc<R>,
    sink: Arc<S>,
    batch_size: usize,
}

impl<R, S> ResultConsumer<R, S>
where
    R: ProcessorRunner + ?Sized,
    S: MetricsSink + ?Sized,
{
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        runner: Arc<R>,
        sink: Arc<S>,
        batch_size: usize,
    ) -> Self {
        Self {
            registry,
            runner,
            sink,
            batch_size: batch_size.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn process(&self, unit: &UnitOfWork, resolution: &mut MessageResolution) {
        let mut handle = match dispatch(&self.registry, self.runner.as_ref(), unit) {
            Ok(handle) => handle,
            Err(ProcessingError::UnsupportedContent { key }) => {
                warn!(key = %key, "No processor consumes this content type, dropping message");
                resolution.resolve(MessageOutcome::Unsupported).await;
                return;
            }
            Err(ProcessingError::Runner(e)) => {
                error!("{}, requeueing message", e);
                resolution.resolve(MessageOutcome::Requeued).await;
                return;
            }
        };

        debug!(processor = handle.processor(), "Processor started");
        self.drain(unit, &mut handle, resolution).await;
    }

    /// Consumes events until the terminal one, settling the message on the way.
    async fn drain(
        &self,
        unit: &UnitOfWork,
        handle: &mut ProcessingHandle,
        resolution: &mut MessageResolution,
    ) {
        let mut batch = Batch::new(self.batch_size);
        let mut delivery_failed = false;
        let mut delivered = 0usize;

        loop {
            let Some(event) = handle.next_event().await else {
                warn!(
                    processor = handle.processor(),
                    "Processor events ended without an outcome"
                );
                resolution.resolve(MessageOutcome::ProcessingFailed).await;
                return;
            };

            match event {
                ProcessingEvent::Record(record) => {
                    if delivery_failed {
                        continue;
                    }
                    let Some(full) = batch.push(record) else {
                        continue;
                    };
                    let count = full.len();
                    match self.flush(unit, handle.processor(), full).await {
                        Ok(()) => delivered += count,
                        Err(e) => {
                            delivery_failed = true;
                            handle.reject(format!("batch delivery failed: {}", e));
                            resolution.resolve(MessageOutcome::DeliveryFailed).await;
                        }
                    }
                }
                ProcessingEvent::Completed => {
                    if delivery_failed {
                        return;
                    }
                    if let Some(rest) = batch.take_remainder() {
                        let count = rest.len();
                        if self.flush(unit, handle.processor(), rest).await.is_err() {
                            resolution.resolve(MessageOutcome::DeliveryFailed).await;
                            return;
                        }
                        delivered += count;
                    }
                    self.delete_artifact(unit).await;
                    resolution.resolve(MessageOutcome::Processed).await;
                    info!(processor = handle.processor(), records = delivered, "Processed");
                    return;
                }
                ProcessingEvent::Failed(failure) => {
                    if delivery_failed {
                        debug!(processor = handle.processor(), "Processor ended: {}", failure);
                        return;
                    }
                    if let Some(rest) = batch.take_remainder() {
                        let count = rest.len();
                        if self.flush(unit, handle.processor(), rest).await.is_ok() {
                            delivered += count;
                        }
                    }
                    error!(
                        processor = handle.processor(),
                        exit_code = ?failure.exit_code,
                        records = delivered,
                        "Processing failed: {}",
                        failure
                    );
                    resolution.resolve(MessageOutcome::ProcessingFailed).await;
                    return;
                }
            }
        }
    }

    async fn flush(
        &self,
        unit: &UnitOfWork,
        processor: &str,
        batch: Vec<Record>,
    ) -> Result<(), GatewayError> {
        match self.sink.send(&unit.processing, &batch).await {
            Ok(()) => {
                debug!(records = batch.len(), "Batch delivered");
                Ok(())
            }
            Err(e) => {
                error!(
                    processor,
                    path = %unit.path().display(),
                    tenant = unit.processing.tenant_id.as_deref().unwrap_or("-"),
                    records = batch.len(),
                    "Failed to deliver batch, artifact kept for reprocessing: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn delete_artifact(&self, unit: &UnitOfWork) {
        match tokio::fs::remove_file(unit.path()).await {
            Ok(()) => {
                metrics::ARTIFACTS_DELETED
                    .with_label_values(&["deleted"])
                    .inc();
                debug!("Artifact deleted");
            }
            Err(e) => {
                metrics::ARTIFACTS_DELETED.with_label_values(&["failed"]).inc();
                warn!(path = %unit.path().display(), "Failed to delete artifact: {}", e);
            }
        }
    }
}

#[async_trait]
impl<R, S> MessageHandler for ResultConsumer<R, S>
where
    R: ProcessorRunner + ?Sized,
    S: MetricsSink + ?Sized,
{
    async fn handle(&self, delivery: Delivery, ack: AckController) {
        let mut resolution = MessageResolution::new(ack);

        let unit = match UnitOfWork::from_delivery(&delivery) {
            Ok(unit) => unit,
            Err(e) => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    routing_key = %delivery.routing_key,
                    "Dropping undecodable message: {}",
                    e
                );
                resolution.resolve(MessageOutcome::Undecodable).await;
                return;
            }
        };

        let span = info_span!(
            "unit",
            key = %unit.key(),
            path = %unit.path().display(),
            tenant = unit.processing.tenant_id.as_deref().unwrap_or("-"),
        );
        self.process(&unit, &mut resolution).instrument(span).await;
    }
}
