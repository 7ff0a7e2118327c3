//! Broker session management.
//!
//! The session keeps exactly one connection and one channel alive. Each
//! consumed content type gets a durable queue bound to the topic exchange
//! with the content-type key as routing key. Connection and channel
//! failures are recovered with capped exponential backoff; a pending
//! reconnect always supersedes a pending channel recreation.

mod amqp;
mod error;
mod recovery;
mod session;
mod topology;
mod traits;
mod types;

pub use amqp::AmqpTransport;
pub use error::{BrokerError, ConnectError};
pub use recovery::{Backoff, RecoveryKind, RecoveryTimers, TimerFired};
pub use session::{SessionHandle, SessionManager};
pub use topology::Topology;
pub use traits::{BrokerChannel, BrokerConnection, BrokerTransport};
pub use types::{
    AckController, Acknowledger, BrokerEndpoint, Delivery, LinkEvent, LinkEventKind, LinkEvents,
    LinkLayer, MessageHandler, SessionStatus,
};
