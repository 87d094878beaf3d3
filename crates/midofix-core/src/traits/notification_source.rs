// # Notification Source Trait
//
// Defines the interface to the event bus that announces port changes.
//
// ## Implementations
//
// - AMQP (oslo.messaging notifications): `midofix-bus-amqp` crate
//
// ## Usage
//
// ```rust,ignore
// use midofix_core::traits::{NotificationResult, NotificationSource};
// use tokio_stream::StreamExt;
//
// let source = /* NotificationSource implementation */;
// source.start().await?;
//
// let mut notifications = source.watch();
// while let Some(notification) = notifications.next().await {
//     println!("{}: {}", notification.event_type, notification.payload);
//     source.acknowledge(notification.delivery_tag, NotificationResult::Handled).await?;
// }
//
// source.stop().await?;
// ```

use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

/// A notification delivered by the bus
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Bus-assigned tag used to acknowledge this delivery
    pub delivery_tag: u64,
    /// Publisher of the notification (e.g. `ceilometer.notification`)
    pub publisher_id: Option<String>,
    /// Envelope event type
    pub event_type: String,
    /// Notification priority (`sample`, `info`, ...)
    pub priority: String,
    /// Raw payload; for ceilometer events a list of event objects
    pub payload: serde_json::Value,
}

impl Notification {
    /// Create a notification with the `sample` priority
    pub fn new(delivery_tag: u64, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            delivery_tag,
            publisher_id: None,
            event_type: event_type.into(),
            priority: "sample".to_string(),
            payload,
        }
    }
}

/// Verdict reported back to the bus for a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationResult {
    /// The notification was consumed and must not be redelivered
    Handled,
    /// The notification should be redelivered
    Requeue,
}

/// Trait for notification bus implementations
///
/// # Lifecycle
///
/// 1. `start()` establishes the subscription (fatal on failure)
/// 2. `watch()` is taken once by the listener
/// 3. Every yielded notification is answered with `acknowledge()`
/// 4. `stop()` cancels the subscription; the stream then ends
///
/// Payloads that cannot be decoded into a [`Notification`] at all are the
/// source's problem: it logs them, acknowledges them and does not yield them.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Start the bus subscription
    async fn start(&self) -> Result<(), crate::Error>;

    /// Stream of incoming notifications
    ///
    /// Only the first call returns a live stream; later calls return an
    /// empty one.
    fn watch(&self) -> Pin<Box<dyn Stream<Item = Notification> + Send + 'static>>;

    /// Report the verdict for a delivery
    async fn acknowledge(
        &self,
        delivery_tag: u64,
        result: NotificationResult,
    ) -> Result<(), crate::Error>;

    /// Stop the bus subscription
    async fn stop(&self) -> Result<(), crate::Error>;

    /// Name used in log lines
    fn source_name(&self) -> &'static str;
}
