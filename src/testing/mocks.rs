//! Mock transport for engine tests
//!
//! Captures publishes and subscription changes, simulates connectivity, and
//! can inject inbound transport events. The optional auto-responder answers
//! every correlated request with a configured `rc`, which keeps happy-path
//! tests from having to thread `reqId`s around by hand.

use crate::error::GatewayError;
use crate::protocol::{parse_agent_topic, TopicBuilder};
use crate::transport::{Qos, Transport, TransportEvent};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// In-memory transport double.
#[derive(Default)]
pub struct MockTransport {
    connected: AtomicBool,
    published: Mutex<Vec<(String, Vec<u8>, Qos)>>,
    subscriptions: Mutex<Vec<String>>,
    unsubscriptions: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    /// When set, every correlated agent request is answered with this `rc`.
    auto_respond_rc: Mutex<Option<u16>>,
}

impl MockTransport {
    pub fn connected() -> Self {
        let transport = Self::default();
        transport.connected.store(true, Ordering::SeqCst);
        transport
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Answer every subsequent correlated request with `rc`.
    pub fn auto_respond(&self, rc: u16) {
        *self.auto_respond_rc.lock().unwrap() = Some(rc);
    }

    pub fn stop_auto_respond(&self) {
        *self.auto_respond_rc.lock().unwrap() = None;
    }

    /// All captured publishes, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>, Qos)> {
        self.published.lock().unwrap().clone()
    }

    /// Payloads published to one topic, in order.
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, payload, _)| payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions.lock().unwrap().clone()
    }

    async fn send_event(&self, event: TransportEvent) {
        let sender = self.events.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Deliver an inbound message as if the broker published it.
    pub async fn inject_message(&self, topic: &str, payload: &[u8]) {
        self.send_event(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
        .await;
    }

    /// Simulate a reconnect with the given unacknowledged deliveries.
    pub async fn inject_reconnected(&self, pending: Vec<(String, Vec<u8>)>) {
        self.connected.store(true, Ordering::SeqCst);
        self.send_event(TransportEvent::Reconnected { pending }).await;
    }

    /// Simulate a connection drop.
    pub async fn inject_disconnected(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.send_event(TransportEvent::Disconnected {
            reason: reason.to_string(),
        })
        .await;
    }

    /// Answer a captured request with the configured `rc`, echoing its
    /// `reqId` on the entity's response topic.
    async fn maybe_auto_respond(&self, topic: &str, payload: &[u8]) {
        let Some(rc) = *self.auto_respond_rc.lock().unwrap() else {
            return;
        };
        let Some((key, _)) = parse_agent_topic(topic) else {
            return;
        };
        let Ok(value) = serde_json::from_slice::<Value>(payload) else {
            return;
        };
        let Some(req_id) = value.get("reqId").and_then(Value::as_str) else {
            return;
        };

        let response = json!({ "rc": rc, "reqId": req_id });
        debug!(entity = %key, rc, "Mock auto-responding");
        self.send_event(TransportEvent::Message {
            topic: TopicBuilder::server_response(&key),
            payload: serde_json::to_vec(&response).unwrap(),
        })
        .await;
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = GatewayError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(GatewayError::internal("mock transport disconnected"));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.clone(), qos));
        self.maybe_auto_respond(topic, &payload).await;
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: Qos) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(GatewayError::internal("mock transport disconnected"));
        }
        self.subscriptions.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), Self::Error> {
        self.unsubscriptions.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    fn set_event_sender(&self, sender: mpsc::Sender<TransportEvent>) {
        self.events.lock().unwrap().replace(sender);
    }
}
