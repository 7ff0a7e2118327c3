//! Broker session: one connection, one channel, and their recovery.
//!
//! A single supervisor task owns the connection, the channel and the
//! recovery timers. Transports report failures as [`LinkEvent`]s; timers
//! report back when they fire. Nothing else touches the session state.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::error::{BrokerError, ConnectError};
use super::recovery::{Backoff, RecoveryKind, RecoveryTimers, TimerFired};
use super::topology::Topology;
use super::traits::{BrokerChannel, BrokerConnection, BrokerTransport};
use super::types::{
    BrokerEndpoint, LinkEvent, LinkEvents, LinkLayer, MessageHandler, SessionStatus,
};
use crate::config::BrokerConfig;
use crate::metrics;
use crate::registry::ProcessorDescriptor;

/// Starts broker sessions.
pub struct SessionManager {
    transport: Arc<dyn BrokerTransport>,
    config: BrokerConfig,
    prefetch: usize,
}

impl SessionManager {
    /// `prefetch` bounds the number of unacknowledged deliveries in flight.
    pub fn new(transport: Arc<dyn BrokerTransport>, config: BrokerConfig, prefetch: usize) -> Self {
        Self {
            transport,
            config,
            prefetch,
        }
    }

    /// Connects, declares one queue per consumed content type and starts
    /// delivering to `handler`.
    pub async fn start(
        &self,
        processors: &[Arc<ProcessorDescriptor>],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SessionHandle, ConnectError> {
        let endpoint = BrokerEndpoint::from_config(&self.config)?;
        let prefetch = u16::try_from(self.prefetch)
            .ok()
            .filter(|p| *p > 0)
            .ok_or(ConnectError::InvalidPrefetch(self.prefetch))?;

        let keys = processors
            .iter()
            .flat_map(|p| p.consumes().iter().cloned())
            .collect();
        let topology = Topology::new(self.config.exchange.clone(), keys);

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Recovering);

        let mut supervisor = Supervisor {
            transport: Arc::clone(&self.transport),
            endpoint,
            topology,
            prefetch,
            handler,
            connection: None,
            channel: None,
            connection_generation: 1,
            channel_generation: 0,
            link_tx,
            link_rx,
            timer_rx,
            timers: RecoveryTimers::new(Backoff::from_config(&self.config.recovery), timer_tx),
            status: status_tx,
            shutting_down: false,
        };

        let connection = supervisor
            .transport
            .connect(&supervisor.endpoint, 1, supervisor.link_tx.clone())
            .await
            .map_err(|source| ConnectError::Unreachable {
                server: supervisor.endpoint.server.clone(),
                source,
            })?;
        supervisor.connection = Some(connection);

        if let Err(e) = supervisor.open_channel().await {
            supervisor.close().await;
            return Err(ConnectError::Topology(e));
        }

        supervisor.status.send_replace(SessionStatus::Connected);
        info!(
            server = %supervisor.endpoint.server,
            exchange = %supervisor.topology.exchange,
            queues = ?supervisor.topology.keys,
            prefetch,
            "Broker session established"
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervisor.run(command_rx));

        Ok(SessionHandle {
            commands: command_tx,
            status: status_rx,
        })
    }
}

#[derive(Debug)]
enum Command {
    Shutdown(oneshot::Sender<()>),
}

/// Controls a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Closes the channel, then the connection. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply_tx)).is_err() {
            return;
        }
        let _ = reply_rx.await;
    }
}

struct Supervisor {
    transport: Arc<dyn BrokerTransport>,
    endpoint: BrokerEndpoint,
    topology: Topology,
    prefetch: u16,
    handler: Arc<dyn MessageHandler>,
    connection: Option<Box<dyn BrokerConnection>>,
    channel: Option<Box<dyn BrokerChannel>>,
    connection_generation: u64,
    channel_generation: u64,
    link_tx: LinkEvents,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    timers: RecoveryTimers,
    status: watch::Sender<SessionStatus>,
    shutting_down: bool,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown(reply)) => {
                            self.close().await;
                            let _ = reply.send(());
                        }
                        None => self.close().await,
                    }
                    break;
                }
                Some(event) = self.link_rx.recv() => self.on_link_event(event),
                Some(fired) = self.timer_rx.recv() => self.on_timer(fired).await,
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        if self.shutting_down {
            return;
        }

        match event.layer {
            LinkLayer::Connection => {
                if event.generation != self.connection_generation {
                    debug!(generation = event.generation, "Ignoring stale {}", event);
                    return;
                }
                if self.timers.is_pending(RecoveryKind::Reconnect) {
                    debug!("Reconnect already scheduled, ignoring {}", event);
                    return;
                }
                warn!(generation = event.generation, "Broker {}", event);
                metrics::BROKER_LINK_FAILURES
                    .with_label_values(&["connection"])
                    .inc();
                self.status.send_replace(SessionStatus::Recovering);
                self.schedule_reconnect();
            }
            LinkLayer::Channel => {
                if event.generation != self.channel_generation {
                    debug!(generation = event.generation, "Ignoring stale {}", event);
                    return;
                }
                if self.timers.is_pending(RecoveryKind::Reconnect) {
                    debug!("Reconnect pending, ignoring {}", event);
                    return;
                }
                warn!(generation = event.generation, "Broker {}", event);
                metrics::BROKER_LINK_FAILURES
                    .with_label_values(&["channel"])
                    .inc();
                self.status.send_replace(SessionStatus::Recovering);
                self.schedule_channel_recreation();
            }
        }
    }

    async fn on_timer(&mut self, fired: TimerFired) {
        if self.shutting_down || !self.timers.claim(fired) {
            return;
        }
        match fired.kind {
            RecoveryKind::Reconnect => self.reconnect().await,
            RecoveryKind::RecreateChannel => self.recreate_channel().await,
        }
    }

    fn schedule_reconnect(&mut self) {
        if let Some(delay) = self.timers.schedule_reconnect() {
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = self.timers.attempt(),
                "Scheduled broker reconnect"
            );
        }
    }

    fn schedule_channel_recreation(&mut self) {
        match self.timers.schedule_channel_recreation() {
            Some(delay) => info!(
                delay_ms = delay.as_millis() as u64,
                attempt = self.timers.attempt(),
                "Scheduled channel recreation"
            ),
            None => debug!("Recovery already scheduled"),
        }
    }

    async fn reconnect(&mut self) {
        self.discard_channel().await;
        self.discard_connection().await;

        self.connection_generation += 1;
        let generation = self.connection_generation;
        info!(generation, "Reconnecting to broker");

        match self
            .transport
            .connect(&self.endpoint, generation, self.link_tx.clone())
            .await
        {
            Ok(connection) => {
                self.connection = Some(connection);
                match self.open_channel().await {
                    Ok(()) => self.recovered(LinkLayer::Connection),
                    Err(e) => {
                        warn!("Reconnected, but channel setup failed: {}", e);
                        self.recovery_failed(LinkLayer::Channel);
                        self.schedule_channel_recreation();
                    }
                }
            }
            Err(e) => {
                warn!(server = %self.endpoint.server, "Reconnect failed: {}", e);
                self.recovery_failed(LinkLayer::Connection);
                self.schedule_reconnect();
            }
        }
    }

    async fn recreate_channel(&mut self) {
        let connection_open = self.connection.as_ref().is_some_and(|c| c.is_open());
        if !connection_open {
            warn!("Connection is gone, reconnecting instead of recreating the channel");
            self.schedule_reconnect();
            return;
        }

        self.discard_channel().await;
        match self.open_channel().await {
            Ok(()) => self.recovered(LinkLayer::Channel),
            Err(e) => {
                warn!("Channel recreation failed: {}", e);
                self.recovery_failed(LinkLayer::Channel);
                self.schedule_channel_recreation();
            }
        }
    }

    /// Opens a channel on the current connection and applies the topology.
    async fn open_channel(&mut self) -> Result<(), BrokerError> {
        self.channel_generation += 1;
        let generation = self.channel_generation;
        let connection = self.connection.as_ref().ok_or(BrokerError::Closed)?;

        let channel = connection
            .open_channel(generation, self.link_tx.clone())
            .await?;
        if let Err(e) = self
            .topology
            .apply(channel.as_ref(), self.prefetch, Arc::clone(&self.handler))
            .await
        {
            let _ = channel.close().await;
            return Err(e);
        }

        debug!(generation, "Channel ready");
        self.channel = Some(channel);
        Ok(())
    }

    fn recovered(&mut self, layer: LinkLayer) {
        self.timers.reset_backoff();
        self.status.send_replace(SessionStatus::Connected);
        metrics::BROKER_RECOVERIES
            .with_label_values(&[layer.as_str(), "success"])
            .inc();
        info!("Broker {} recovered", layer.as_str());
    }

    fn recovery_failed(&self, layer: LinkLayer) {
        metrics::BROKER_RECOVERIES
            .with_label_values(&[layer.as_str(), "failure"])
            .inc();
    }

    async fn discard_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            if channel.is_open() {
                if let Err(e) = channel.close().await {
                    debug!("Failed to close channel: {}", e);
                }
            }
        }
    }

    async fn discard_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            if connection.is_open() {
                if let Err(e) = connection.close().await {
                    debug!("Failed to close connection: {}", e);
                }
            }
        }
    }

    async fn close(&mut self) {
        self.shutting_down = true;
        self.timers.cancel_all();

        if let Some(channel) = self.channel.take() {
            if channel.is_open() {
                if let Err(e) = channel.close().await {
                    warn!("Failed to close broker channel: {}", e);
                }
            }
        }
        if let Some(connection) = self.connection.take() {
            if connection.is_open() {
                if let Err(e) = connection.close().await {
                    warn!("Failed to close broker connection: {}", e);
                }
            }
        }

        self.status.send_replace(SessionStatus::Closed);
        info!("Broker session closed");
    }
}
