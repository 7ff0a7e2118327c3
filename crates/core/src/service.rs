//! Service bootstrap: discovery, registry, consumer and broker session.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::broker::{BrokerTransport, ConnectError, SessionHandle, SessionManager, SessionStatus};
use crate::config::Config;
use crate::gateway::MetricsSink;
use crate::orchestrator::ResultConsumer;
use crate::registry::{discover, DiscoveryError, ProcessorRegistry};
use crate::runner::ProcessorRunner;

/// Startup failures. All of them keep the service from becoming ready.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Found no result processors in {}", path.display())]
    NoProcessors { path: PathBuf },

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// A running worker.
pub struct HarvesterService {
    registry: Arc<ProcessorRegistry>,
    session: SessionHandle,
}

impl HarvesterService {
    /// Discovers processors and starts consuming.
    pub async fn start<R, S>(
        config: &Config,
        transport: Arc<dyn BrokerTransport>,
        runner: Arc<R>,
        sink: Arc<S>,
    ) -> Result<Self, ServiceError>
    where
        R: ProcessorRunner + ?Sized,
        S: MetricsSink + ?Sized,
    {
        let root = &config.processors.path;
        let descriptors = discover(root, config.processors.self_test_timeout()).await?;
        if descriptors.is_empty() {
            return Err(ServiceError::NoProcessors { path: root.clone() });
        }

        let registry = Arc::new(ProcessorRegistry::new(descriptors));
        info!(
            processors = registry.len(),
            content_types = ?registry
                .content_type_keys()
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>(),
            "Processor registry ready"
        );

        let consumer = ResultConsumer::new(Arc::clone(&registry), runner, sink, config.batch.size);
        let parallelism = config.processors.effective_parallelism();
        let manager = SessionManager::new(transport, config.broker.clone(), parallelism);
        let session = manager
            .start(registry.descriptors(), Arc::new(consumer))
            .await?;

        Ok(Self { registry, session })
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Closes the broker session. In-flight units are not waited for.
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
    }
}
