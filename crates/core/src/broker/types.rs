//! Types exchanged between the session manager, transports and handlers.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;

use super::error::{BrokerError, ConnectError};
use crate::config::BrokerConfig;

/// One inbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

impl Delivery {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Transport-side settlement of a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// Settles one delivery. Consumed on use, so a message is settled at most once.
pub struct AckController {
    delivery_tag: u64,
    inner: Box<dyn Acknowledger>,
}

impl AckController {
    pub fn new(delivery_tag: u64, inner: impl Acknowledger + 'static) -> Self {
        Self {
            delivery_tag,
            inner: Box::new(inner),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub async fn ack(self) {
        if let Err(e) = self.inner.ack().await {
            warn!(delivery_tag = self.delivery_tag, "Ack failed: {}", e);
        }
    }

    pub async fn nack(self, requeue: bool) {
        if let Err(e) = self.inner.nack(requeue).await {
            warn!(delivery_tag = self.delivery_tag, "Nack failed: {}", e);
        }
    }
}

impl fmt::Debug for AckController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckController")
            .field("delivery_tag", &self.delivery_tag)
            .finish_non_exhaustive()
    }
}

/// Receives every delivery. The handler owns the ack/nack decision.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery, ack: AckController);
}

/// Which part of the session a [`LinkEvent`] concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Connection,
    Channel,
}

impl LinkLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Channel => "channel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventKind {
    Closed(Option<String>),
    Failed(String),
}

/// Asynchronous failure notification from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub layer: LinkLayer,
    /// Generation of the connection or channel that produced the event.
    pub generation: u64,
    pub kind: LinkEventKind,
}

impl LinkEvent {
    pub fn connection(generation: u64, kind: LinkEventKind) -> Self {
        Self {
            layer: LinkLayer::Connection,
            generation,
            kind,
        }
    }

    pub fn channel(generation: u64, kind: LinkEventKind) -> Self {
        Self {
            layer: LinkLayer::Channel,
            generation,
            kind,
        }
    }
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LinkEventKind::Closed(Some(reason)) => {
                write!(f, "{} closed: {}", self.layer.as_str(), reason)
            }
            LinkEventKind::Closed(None) => write!(f, "{} closed", self.layer.as_str()),
            LinkEventKind::Failed(reason) => {
                write!(f, "{} failed: {}", self.layer.as_str(), reason)
            }
        }
    }
}

pub type LinkEvents = mpsc::UnboundedSender<LinkEvent>;

/// Externally visible state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    Recovering,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Recovering => "recovering",
            Self::Closed => "closed",
        }
    }
}

/// Validated connection parameters.
#[derive(Clone)]
pub struct BrokerEndpoint {
    pub server: String,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub heartbeat_secs: u16,
    pub frame_max: u32,
}

impl BrokerEndpoint {
    pub fn from_config(config: &BrokerConfig) -> Result<Self, ConnectError> {
        let user = config
            .user
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(ConnectError::MissingCredentials)?;
        let server = config
            .server
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConnectError::MissingAddress)?;

        Ok(Self {
            server: server.to_string(),
            user: user.to_string(),
            password: config.password.clone(),
            vhost: config.vhost.clone(),
            heartbeat_secs: config.heartbeat_secs,
            frame_max: config.frame_max,
        })
    }

    /// AMQP URI with credentials and vhost percent-encoded.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}/{}?heartbeat={}&frame_max={}",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            self.server,
            urlencoding::encode(&self.vhost),
            self.heartbeat_secs,
            self.frame_max
        )
    }
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("server", &self.server)
            .field("user", &self.user)
            .field("password", &"[redacted]")
            .field("vhost", &self.vhost)
            .finish()
    }
}
