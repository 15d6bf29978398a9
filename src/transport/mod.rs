//! Transport layer for the gateway agent
//!
//! This module provides the transport abstraction the management engine is
//! written against, and an MQTT implementation. The engine never talks to the
//! broker directly; everything goes through this trait so tests can inject a
//! mock transport.

use tokio::sync::mpsc;

pub mod mqtt;

/// Quality of service for publishes and subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Events the transport delivers asynchronously to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An inbound message on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// The connection was re-established after an unplanned drop.
    ///
    /// `pending` is the snapshot of QoS 1 deliveries that were unacknowledged
    /// at disconnect time, in publish order.
    Reconnected { pending: Vec<(String, Vec<u8>)> },
    /// The connection dropped. Session state is unaffected; the engine only
    /// observes this for logging.
    Disconnected { reason: String },
}

/// Transport abstraction over the pub/sub broker connection.
///
/// Connect/disconnect are driven by the owning application; the engine only
/// publishes, manages subscriptions, and consumes the event channel.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker.
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Disconnect from the broker.
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Whether the connection is currently up.
    fn is_connected(&self) -> bool;

    /// Publish a message.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), Self::Error>;

    /// Subscribe to a topic filter. Subscriptions do not survive a clean
    /// session reset; implementations re-apply them on reconnect.
    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), Self::Error>;

    /// Unsubscribe from a topic filter.
    async fn unsubscribe(&self, filter: &str) -> Result<(), Self::Error>;

    /// Register the channel inbound messages and connectivity events are
    /// delivered on. Events arriving before registration are discarded.
    fn set_event_sender(&self, sender: mpsc::Sender<TransportEvent>);
}

/// Type alias for the MQTT transport
pub type MqttTransport = mqtt::MqttClient;
