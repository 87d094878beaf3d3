// # AMQP Notification Source
//
// This crate consumes oslo.messaging notifications from an AMQP broker.
//
// ## Topology
//
// ```text
// exchange <exchange> (topic) ──routing key <topic>.<priority>──► queue <topic>.<priority>
// ```
//
// Exchange and queue are declared with the oslo.messaging defaults
// (non-durable, not auto-deleted) so that declaring them next to running
// OpenStack services does not fail with PRECONDITION_FAILED.
//
// ## Message Formats
//
// Both forms are accepted:
//
// - bare: `{"event_type": ..., "payload": ..., "publisher_id": ..., "priority": ...}`
// - oslo 2.0 envelope: `{"oslo.version": "2.0", "oslo.message": "<bare message as JSON string>"}`
//
// Messages that are neither are logged, acknowledged and never reach the
// listener.

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use midofix_core::config::BusConfig;
use midofix_core::traits::{Notification, NotificationResult, NotificationSource};
use midofix_core::{Error, Result};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

/// Unacknowledged deliveries the broker may push at once
const DEFAULT_PREFETCH: u16 = 64;

/// Envelope key holding the serialized message
const OSLO_MESSAGE_KEY: &str = "oslo.message";

/// Envelope key holding the envelope version
const OSLO_VERSION_KEY: &str = "oslo.version";

/// First wait before reconnecting to the broker
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for the reconnect backoff
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Low bits of a notification's delivery tag carry the broker's tag, the
/// high bits the session generation it was delivered on
const TAG_BITS: u32 = 48;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// Live broker session
struct Session {
    connection: Connection,
    channel: Channel,
    consumer_tag: String,
    generation: u16,
}

/// State shared between the source and its consumer task
struct Shared {
    config: BusConfig,
    prefetch: u16,
    session: Mutex<Option<Session>>,
}

/// oslo.messaging notification consumer
///
/// Reconnects with exponential backoff when the broker connection or the
/// consumer goes away. Deliveries from a lost channel were requeued by the
/// broker, so their acknowledgements are skipped.
pub struct AmqpNotificationSource {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
    tx: std::sync::Mutex<Option<mpsc::Sender<Notification>>>,
    rx: std::sync::Mutex<Option<mpsc::Receiver<Notification>>>,
}

// Custom Debug implementation that hides the broker credentials
impl std::fmt::Debug for AmqpNotificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpNotificationSource")
            .field("transport_url", &"<REDACTED>")
            .field("exchange", &self.shared.config.exchange)
            .field("routing_key", &self.shared.config.routing_key())
            .field("prefetch", &self.shared.prefetch)
            .finish()
    }
}

impl AmqpNotificationSource {
    /// Create a source; nothing is connected until `start()`
    pub fn new(config: BusConfig) -> Result<Self> {
        Self::with_prefetch(config, DEFAULT_PREFETCH)
    }

    /// Create a source with a custom prefetch count
    pub fn with_prefetch(config: BusConfig, prefetch: u16) -> Result<Self> {
        config.validate()?;
        if prefetch == 0 {
            return Err(Error::config("AMQP prefetch count must be > 0"));
        }

        let (tx, rx) = mpsc::channel(usize::from(prefetch));
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                prefetch,
                session: Mutex::new(None),
            }),
            pump: Mutex::new(None),
            tx: std::sync::Mutex::new(Some(tx)),
            rx: std::sync::Mutex::new(Some(rx)),
        })
    }
}

impl Shared {
    async fn subscribe(&self) -> Result<(Connection, Channel, Consumer)> {
        let queue = self.config.routing_key();

        let connection = Connection::connect(&self.config.transport_url, ConnectionProperties::default())
            .await
            .map_err(|e| Error::bus(format!("failed to connect to broker: {}", e)))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::bus(format!("failed to open channel: {}", e)))?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| Error::bus(format!("failed to set prefetch: {}", e)))?;
        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                Error::bus(format!("failed to declare exchange {}: {}", self.config.exchange, e))
            })?;
        channel
            .queue_declare(&queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| Error::bus(format!("failed to declare queue {}: {}", queue, e)))?;
        channel
            .queue_bind(
                &queue,
                &self.config.exchange,
                &queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::bus(format!("failed to bind queue {}: {}", queue, e)))?;

        let consumer = channel
            .basic_consume(
                &queue,
                &format!("mido-fixer-{}", std::process::id()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::bus(format!("failed to consume from {}: {}", queue, e)))?;

        Ok((connection, channel, consumer))
    }

    /// Subscribe and install the new session, closing the one it replaces
    async fn open_session(&self, generation: u16) -> Result<(Consumer, Channel)> {
        let (connection, channel, consumer) = self.subscribe().await?;
        let session = Session {
            connection,
            channel: channel.clone(),
            consumer_tag: consumer.tag().as_str().to_string(),
            generation,
        };

        let previous = self.session.lock().await.replace(session);
        if let Some(previous) = previous {
            if let Err(e) = previous.connection.close(200, "reconnect").await {
                tracing::debug!("Failed to close previous connection: {}", e);
            }
        }
        Ok((consumer, channel))
    }
}

#[async_trait]
impl NotificationSource for AmqpNotificationSource {
    async fn start(&self) -> Result<()> {
        let mut pump_slot = self.pump.lock().await;
        if pump_slot.is_some() {
            return Ok(());
        }

        let tx = self
            .tx
            .lock()
            .map_err(|_| Error::bus("notification sender lock poisoned"))?
            .take()
            .ok_or_else(|| Error::bus("notification source cannot be restarted"))?;

        let (consumer, channel) = match self.shared.open_session(0).await {
            Ok(opened) => opened,
            Err(e) => {
                if let Ok(mut slot) = self.tx.lock() {
                    *slot = Some(tx);
                }
                return Err(e);
            }
        };
        tracing::info!(
            "Consuming {} notifications from exchange {}",
            self.shared.config.routing_key(),
            self.shared.config.exchange
        );

        *pump_slot = Some(tokio::spawn(pump(
            Arc::clone(&self.shared),
            consumer,
            channel,
            tx,
        )));
        Ok(())
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = Notification> + Send + 'static>> {
        let rx = self.rx.lock().ok().and_then(|mut rx| rx.take());
        match rx {
            Some(rx) => Box::pin(ReceiverStream::new(rx)),
            None => {
                tracing::warn!("Notification stream already taken");
                Box::pin(tokio_stream::empty())
            }
        }
    }

    async fn acknowledge(&self, delivery_tag: u64, result: NotificationResult) -> Result<()> {
        let (channel, broker_tag) = {
            let session = self.shared.session.lock().await;
            let session = session.as_ref().ok_or_else(|| Error::bus("not subscribed"))?;
            match broker_tag_for(session.generation, delivery_tag) {
                Some(tag) => (session.channel.clone(), tag),
                None => {
                    tracing::debug!(
                        "Skipping acknowledgement of {}: delivered on a previous connection",
                        delivery_tag
                    );
                    return Ok(());
                }
            }
        };

        match result {
            NotificationResult::Handled => channel
                .basic_ack(broker_tag, BasicAckOptions::default())
                .await
                .map_err(|e| Error::bus(format!("failed to ack {}: {}", broker_tag, e))),
            NotificationResult::Requeue => channel
                .basic_nack(
                    broker_tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    },
                )
                .await
                .map_err(|e| Error::bus(format!("failed to requeue {}: {}", broker_tag, e))),
        }
    }

    async fn stop(&self) -> Result<()> {
        // The consumer task goes first so it cannot reconnect behind our back
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
            let _ = pump.await;
        }

        let Some(session) = self.shared.session.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = session
            .channel
            .basic_cancel(&session.consumer_tag, BasicCancelOptions::default())
            .await
        {
            tracing::warn!("Failed to cancel consumer: {}", e);
        }
        if let Err(e) = session.channel.close(200, "shutdown").await {
            tracing::debug!("Failed to close channel: {}", e);
        }

        session
            .connection
            .close(200, "shutdown")
            .await
            .map_err(|e| Error::bus(format!("failed to close connection: {}", e)))?;
        tracing::info!("Disconnected from broker");
        Ok(())
    }

    fn source_name(&self) -> &'static str {
        "amqp"
    }
}

/// Tag handed to the listener for a delivery on the given session
fn notification_tag(generation: u16, broker_tag: u64) -> u64 {
    (u64::from(generation) << TAG_BITS) | (broker_tag & TAG_MASK)
}

/// Broker tag to acknowledge, or `None` when the delivery belongs to
/// another session
fn broker_tag_for(generation: u16, delivery_tag: u64) -> Option<u64> {
    ((delivery_tag >> TAG_BITS) == u64::from(generation)).then_some(delivery_tag & TAG_MASK)
}

fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(MAX_RECONNECT_DELAY)
}

/// Forward decoded deliveries to the listener, reconnecting when the
/// consumer ends
///
/// Ends when the listener's stream is dropped or the task is aborted.
async fn pump(
    shared: Arc<Shared>,
    mut consumer: Consumer,
    mut channel: Channel,
    tx: mpsc::Sender<Notification>,
) {
    let mut generation = 0u16;
    loop {
        if !forward(&mut consumer, &channel, generation, &tx).await {
            tracing::debug!("Notification stream dropped, stopping consumer");
            return;
        }

        tracing::warn!("Consumer ended, reconnecting to broker");
        let mut delay = INITIAL_RECONNECT_DELAY;
        loop {
            tokio::time::sleep(delay).await;
            if tx.is_closed() {
                return;
            }

            let next = generation.wrapping_add(1);
            match shared.open_session(next).await {
                Ok((reopened, reopened_channel)) => {
                    consumer = reopened;
                    channel = reopened_channel;
                    generation = next;
                    tracing::info!("Reconnected to broker");
                    break;
                }
                Err(e) => {
                    delay = next_backoff(delay);
                    tracing::warn!("Reconnect failed, retrying in {:?}: {}", delay, e);
                }
            }
        }
    }
}

/// Returns false once the listener is gone, true when the consumer ended
async fn forward(
    consumer: &mut Consumer,
    channel: &Channel,
    generation: u16,
    tx: &mpsc::Sender<Notification>,
) -> bool {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::error!("Consumer failed: {}", e);
                return true;
            }
        };

        let tag = notification_tag(generation, delivery.delivery_tag);
        match decode_notification(tag, &delivery.data) {
            Ok(notification) => {
                if tx.send(notification).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Dropping undecodable message {}: {} (body: {})",
                    delivery.delivery_tag,
                    e,
                    String::from_utf8_lossy(&delivery.data)
                );
                if let Err(e) = channel
                    .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
                    .await
                {
                    tracing::warn!("Failed to ack {}: {}", delivery.delivery_tag, e);
                }
            }
        }
    }
    true
}

/// Decode a message body into a notification
///
/// Unwraps the oslo 2.0 envelope when present.
pub fn decode_notification(delivery_tag: u64, body: &[u8]) -> Result<Notification> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Error::payload(format!("body is not JSON: {}", e)))?;

    let message = match value.get(OSLO_MESSAGE_KEY) {
        Some(Value::String(inner)) => {
            if let Some(version) = value.get(OSLO_VERSION_KEY).and_then(Value::as_str) {
                if !version.starts_with("2.") {
                    return Err(Error::payload(format!(
                        "unsupported envelope version {}",
                        version
                    )));
                }
            }
            serde_json::from_str(inner)
                .map_err(|e| Error::payload(format!("envelope message is not JSON: {}", e)))?
        }
        Some(_) => return Err(Error::payload("envelope message is not a string")),
        None => value,
    };

    let event_type = message
        .get("event_type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::payload("message has no event_type"))?
        .to_string();

    let mut notification = Notification::new(
        delivery_tag,
        event_type,
        message.get("payload").cloned().unwrap_or(Value::Null),
    );
    notification.publisher_id = message
        .get("publisher_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(priority) = message.get("priority").and_then(Value::as_str) {
        notification.priority = priority.to_lowercase();
    }
    Ok(notification)
}
