//! AMQP 0-9-1 transport backed by lapin.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::error::BrokerError;
use super::traits::{BrokerChannel, BrokerConnection, BrokerTransport};
use super::types::{
    AckController, Acknowledger, BrokerEndpoint, Delivery, LinkEvent, LinkEventKind, LinkEvents,
    MessageHandler,
};

const REPLY_SUCCESS: u16 = 200;

/// Connects with lapin, driving its I/O and tasks on the current tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        generation: u64,
        events: LinkEvents,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        debug!(server = %endpoint.server, vhost = %endpoint.vhost, generation, "Connecting");
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = Connection::connect(&endpoint.uri(), properties)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        connection.on_error(move |e| {
            let _ = events.send(LinkEvent::connection(
                generation,
                LinkEventKind::Failed(e.to_string()),
            ));
        });

        Ok(Box::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(
        &self,
        generation: u64,
        events: LinkEvents,
    ) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        Ok(Box::new(AmqpChannel {
            inner: channel,
            generation,
            events,
        }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(REPLY_SUCCESS, "worker shutting down")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

struct AmqpChannel {
    inner: Channel,
    generation: u64,
    events: LinkEvents,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.inner
            .basic_qos(count, BasicQosOptions { global: true })
            .await
            .map_err(|e| BrokerError::topology("prefetch", e))
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        self.inner
            .exchange_declare(name, ExchangeKind::Topic, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::topology(format!("exchange {}", name), e))
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };
        self.inner
            .queue_declare(name, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::topology(format!("queue {}", name), e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::topology(format!("binding {} -> {}", exchange, queue), e))
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        let tag = format!("harvester-{}", uuid::Uuid::new_v4());
        let mut consumer = self
            .inner
            .basic_consume(queue, &tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| BrokerError::topology(format!("consumer on {}", queue), e))?;

        let events = self.events.clone();
        let generation = self.generation;
        let queue = queue.to_string();
        tokio::spawn(async move {
            let reason = loop {
                match consumer.next().await {
                    Some(Ok(delivery)) => {
                        let (delivery, acker) = convert_delivery(delivery);
                        trace!(queue = %queue, delivery_tag = delivery.delivery_tag, "Delivery received");
                        let controller =
                            AckController::new(delivery.delivery_tag, AmqpAcker { inner: acker });
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            handler.handle(delivery, controller).await;
                        });
                    }
                    Some(Err(e)) => break LinkEventKind::Failed(e.to_string()),
                    None => break LinkEventKind::Closed(Some(format!("consumer on {} ended", queue))),
                }
            };
            debug!(queue = %queue, generation, "Consumer stopped");
            let _ = events.send(LinkEvent::channel(generation, reason));
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(REPLY_SUCCESS, "channel closed by worker")
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }
}

struct AmqpAcker {
    inner: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Settle(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.inner
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| BrokerError::Settle(e.to_string()))
    }
}

fn convert_delivery(delivery: lapin::message::Delivery) -> (Delivery, Acker) {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(header_strings)
        .unwrap_or_default();

    let converted = Delivery {
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.as_str().to_string(),
        headers,
        payload: delivery.data,
        redelivered: delivery.redelivered,
    };
    (converted, delivery.acker)
}

/// Keeps headers that have a sensible string form.
fn header_strings(table: &FieldTable) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for (name, value) in table.inner() {
        let text = match value {
            AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
            AMQPValue::ShortString(s) => s.as_str().to_string(),
            AMQPValue::Boolean(b) => b.to_string(),
            AMQPValue::ShortShortInt(n) => n.to_string(),
            AMQPValue::ShortShortUInt(n) => n.to_string(),
            AMQPValue::ShortInt(n) => n.to_string(),
            AMQPValue::ShortUInt(n) => n.to_string(),
            AMQPValue::LongInt(n) => n.to_string(),
            AMQPValue::LongUInt(n) => n.to_string(),
            AMQPValue::LongLongInt(n) => n.to_string(),
            AMQPValue::Timestamp(n) => n.to_string(),
            _ => {
                warn!(header = %name.as_str(), "Ignoring non-scalar header");
                continue;
            }
        };
        headers.insert(name.as_str().to_string(), text);
    }
    headers
}
