//! Error types for the broker module.

use thiserror::Error;

/// Failures reported by a broker transport.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel failed: {0}")]
    Channel(String),

    #[error("Failed to declare {what}: {reason}")]
    Topology { what: String, reason: String },

    #[error("Failed to settle delivery: {0}")]
    Settle(String),

    #[error("Session is closed")]
    Closed,
}

impl BrokerError {
    pub fn topology(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Topology {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failures of the initial session start. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Broker credentials are not configured (broker.user / AMQ_USER)")]
    MissingCredentials,

    #[error("Broker address is not configured (broker.server / AMQ_SERVER)")]
    MissingAddress,

    #[error("Prefetch {0} is out of range")]
    InvalidPrefetch(usize),

    #[error("Broker at {server} is unreachable: {source}")]
    Unreachable {
        server: String,
        #[source]
        source: BrokerError,
    },

    #[error("Failed to set up consumption: {0}")]
    Topology(#[source] BrokerError),
}
