//! In-memory broker transport for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::broker::{
    AckController, Acknowledger, BrokerChannel, BrokerConnection, BrokerEndpoint, BrokerError,
    BrokerTransport, Delivery, LinkEvent, LinkEventKind, LinkEvents, MessageHandler,
};

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckRecord {
    Acked(u64),
    Nacked { tag: u64, requeue: bool },
}

impl AckRecord {
    pub fn tag(&self) -> u64 {
        match self {
            Self::Acked(tag) => *tag,
            Self::Nacked { tag, .. } => *tag,
        }
    }
}

/// A queue binding as declared by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

struct Link {
    generation: u64,
    open: Arc<AtomicBool>,
    events: LinkEvents,
}

#[derive(Default)]
struct BrokerState {
    connect_attempts: usize,
    connects: usize,
    channels_opened: usize,
    connections_closed: usize,
    channels_closed: usize,
    refuse_connections: usize,
    refuse_channels: usize,
    connection: Option<Link>,
    channel: Option<Link>,
    endpoints: Vec<BrokerEndpoint>,
    prefetch: Option<u16>,
    exchanges: Vec<String>,
    queues: Vec<String>,
    bindings: Vec<Binding>,
    consumers: HashMap<String, Arc<dyn MessageHandler>>,
    acks: Vec<AckRecord>,
    next_tag: u64,
}

/// Broker transport that keeps everything in memory.
///
/// Records the declared topology and every ack/nack, and lets tests break
/// the connection or the channel the way a real broker would:
///
/// ```rust,ignore
/// let broker = MemoryBroker::new();
/// let session = SessionManager::new(Arc::new(broker.clone()), config, 4)
///     .start(&processors, handler)
///     .await?;
///
/// broker.publish("cpu/host", br#"{"dataType":"cpu/host"}"#, &[("path", "/tmp/x")]);
/// let acks = broker.wait_for_acks(1).await;
///
/// broker.drop_connection("heartbeat timeout");
/// broker.wait_for_connects(2).await;
/// ```
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: usize) {
        self.lock().refuse_connections = count;
    }

    /// The next `count` channel opens fail.
    pub fn refuse_channels(&self, count: usize) {
        self.lock().refuse_channels = count;
    }

    /// Breaks the current connection. Its channel goes down with it.
    pub fn drop_connection(&self, reason: &str) {
        let state = self.lock();
        if let Some(channel) = &state.channel {
            channel.open.store(false, Ordering::SeqCst);
        }
        if let Some(connection) = &state.connection {
            connection.open.store(false, Ordering::SeqCst);
            let _ = connection.events.send(LinkEvent::connection(
                connection.generation,
                LinkEventKind::Failed(reason.to_string()),
            ));
        }
        if let Some(channel) = &state.channel {
            let _ = channel.events.send(LinkEvent::channel(
                channel.generation,
                LinkEventKind::Closed(Some(reason.to_string())),
            ));
        }
    }

    /// Closes the current channel, leaving the connection up.
    pub fn drop_channel(&self, reason: &str) {
        let state = self.lock();
        if let Some(channel) = &state.channel {
            channel.open.store(false, Ordering::SeqCst);
            let _ = channel.events.send(LinkEvent::channel(
                channel.generation,
                LinkEventKind::Closed(Some(reason.to_string())),
            ));
        }
    }

    /// Sends `event` to the session as if the transport had raised it.
    pub fn inject(&self, event: LinkEvent) {
        let state = self.lock();
        if let Some(connection) = &state.connection {
            let _ = connection.events.send(event);
        }
    }

    /// Publishes to the consumer of every queue bound with `routing_key`.
    /// Returns the delivery tags used.
    pub fn publish(&self, routing_key: &str, payload: &[u8], headers: &[(&str, &str)]) -> Vec<u64> {
        let mut state = self.lock();
        let channel_open = state
            .channel
            .as_ref()
            .is_some_and(|c| c.open.load(Ordering::SeqCst));
        if !channel_open {
            return Vec::new();
        }

        let queues: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();

        let mut tags = Vec::new();
        for queue in queues {
            let Some(handler) = state.consumers.get(&queue).cloned() else {
                continue;
            };
            state.next_tag += 1;
            let tag = state.next_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                routing_key: routing_key.to_string(),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
                payload: payload.to_vec(),
                redelivered: false,
            };
            let acker = MemoryAcker {
                tag,
                state: Arc::clone(&self.state),
            };
            tokio::spawn(async move {
                handler.handle(delivery, AckController::new(tag, acker)).await;
            });
            tags.push(tag);
        }
        tags
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn channels_opened(&self) -> usize {
        self.lock().channels_opened
    }

    pub fn connections_closed(&self) -> usize {
        self.lock().connections_closed
    }

    pub fn channels_closed(&self) -> usize {
        self.lock().channels_closed
    }

    pub fn is_connected(&self) -> bool {
        let state = self.lock();
        let open = |link: &Option<Link>| {
            link.as_ref()
                .is_some_and(|l| l.open.load(Ordering::SeqCst))
        };
        open(&state.connection) && open(&state.channel)
    }

    pub fn connection_generation(&self) -> Option<u64> {
        self.lock().connection.as_ref().map(|c| c.generation)
    }

    pub fn channel_generation(&self) -> Option<u64> {
        self.lock().channel.as_ref().map(|c| c.generation)
    }

    pub fn endpoints(&self) -> Vec<BrokerEndpoint> {
        self.lock().endpoints.clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.lock().prefetch
    }

    pub fn exchanges(&self) -> Vec<String> {
        self.lock().exchanges.clone()
    }

    pub fn queues(&self) -> Vec<String> {
        self.lock().queues.clone()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.lock().bindings.clone()
    }

    pub fn acks(&self) -> Vec<AckRecord> {
        self.lock().acks.clone()
    }

    /// Waits until at least `count` deliveries were settled.
    pub async fn wait_for_acks(&self, count: usize) -> Vec<AckRecord> {
        self.wait_until(|s| s.acks.len() >= count).await;
        self.acks()
    }

    pub async fn wait_for_connects(&self, count: usize) {
        self.wait_until(|s| s.connects >= count).await;
    }

    pub async fn wait_for_channels(&self, count: usize) {
        self.wait_until(|s| s.channels_opened >= count).await;
    }

    /// Polls for up to 60 seconds of (possibly paused) tokio time.
    async fn wait_until(&self, condition: impl Fn(&BrokerState) -> bool) {
        for _ in 0..6000 {
            if condition(&self.lock()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("MemoryBroker condition not reached in time");
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        generation: u64,
        events: LinkEvents,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        state.endpoints.push(endpoint.clone());
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(BrokerError::Connection("connection refused".to_string()));
        }

        state.connects += 1;
        let open = Arc::new(AtomicBool::new(true));
        state.connection = Some(Link {
            generation,
            open: Arc::clone(&open),
            events,
        });
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            open,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    open: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(
        &self,
        generation: u64,
        events: LinkEvents,
    ) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let mut state = self.lock();
        if state.refuse_channels > 0 {
            state.refuse_channels -= 1;
            return Err(BrokerError::Channel("channel refused".to_string()));
        }

        state.channels_opened += 1;
        let open = Arc::new(AtomicBool::new(true));
        state.channel = Some(Link {
            generation,
            open: Arc::clone(&open),
            events,
        });
        Ok(Box::new(MemoryChannel {
            state: Arc::clone(&self.state),
            open,
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.lock().connections_closed += 1;
        }
        Ok(())
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.lock()?.prefetch = Some(count);
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        if !state.exchanges.iter().any(|e| e == name) {
            state.exchanges.push(name.to_string());
        }
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        if !state.queues.iter().any(|q| q == name) {
            state.queues.push(name.to_string());
        }
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        self.lock()?.consumers.insert(queue.to_string(), handler);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Ok(mut state) = self.state.lock() {
                state.channels_closed += 1;
            }
        }
        Ok(())
    }
}

struct MemoryAcker {
    tag: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryAcker {
    fn record(&self, record: AckRecord) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.acks.push(record);
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.record(AckRecord::Acked(self.tag));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.record(AckRecord::Nacked {
            tag: self.tag,
            requeue,
        });
        Ok(())
    }
}
