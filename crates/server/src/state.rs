use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

use harvester_core::{Config, ProcessorRegistry, SanitizedConfig, SessionStatus};

/// Shared application state
pub struct AppState {
    config: Config,
    registry: Arc<ProcessorRegistry>,
    status: watch::Receiver<SessionStatus>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: Arc<ProcessorRegistry>,
        status: watch::Receiver<SessionStatus>,
    ) -> Self {
        Self {
            config,
            registry,
            status,
            started_at: Utc::now(),
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn broker_status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
