//! Impure I/O operations for the MQTT transport
//!
//! This module owns the rumqttc client and its event loop task. The event
//! loop converts broker activity into [`TransportEvent`]s for the engine:
//! inbound publishes, reconnections (with the snapshot of unacknowledged
//! QoS 1 deliveries), and disconnections.

use super::connection::{configure_mqtt_options, to_mqtt_qos, ConnectionState, MqttError};
use crate::config::MqttSection;
use crate::transport::{Qos, Transport, TransportEvent};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// MQTT transport for the gateway agent
pub struct MqttClient {
    client_id: String,
    client: Arc<Mutex<AsyncClient>>,
    // Wrapped in a Mutex because rumqttc's EventLoop is not Sync; it is
    // taken out whole when connect() hands it to the event loop task.
    event_loop: Option<Mutex<EventLoop>>,
    config: MqttSection,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    shared: Arc<SharedState>,
}

/// State shared between the client handle and the event loop task.
struct SharedState {
    /// Topic filters to re-apply after every ConnAck.
    subscriptions: StdMutex<Vec<String>>,
    /// QoS 1 publishes awaiting PubAck, in publish order. The broker
    /// acknowledges QoS 1 in order, so acks pop from the front.
    in_flight: StdMutex<VecDeque<(String, Vec<u8>)>>,
    /// Where transport events are delivered once the engine registers.
    events: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
    /// Counts ConnAcks so the first connection is not reported as a
    /// reconnection.
    epoch: AtomicU64,
}

impl SharedState {
    fn new() -> Self {
        SharedState {
            subscriptions: StdMutex::new(Vec::new()),
            in_flight: StdMutex::new(VecDeque::new()),
            events: StdMutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    fn subscriptions_snapshot(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    fn track_subscription(&self, filter: &str) {
        let mut subs = self.subscriptions.lock().unwrap();
        if !subs.iter().any(|f| f == filter) {
            subs.push(filter.to_string());
        }
    }

    fn untrack_subscription(&self, filter: &str) {
        self.subscriptions.lock().unwrap().retain(|f| f != filter);
    }

    fn push_in_flight(&self, topic: &str, payload: &[u8]) {
        self.in_flight
            .lock()
            .unwrap()
            .push_back((topic.to_string(), payload.to_vec()));
    }

    fn ack_in_flight(&self) {
        self.in_flight.lock().unwrap().pop_front();
    }

    fn drain_in_flight(&self) -> Vec<(String, Vec<u8>)> {
        self.in_flight.lock().unwrap().drain(..).collect()
    }

    async fn forward(&self, event: TransportEvent) {
        // Clone the sender out so the lock is not held across the await
        let sender = self.events.lock().unwrap().clone();
        match sender {
            Some(sender) => {
                if sender.send(event).await.is_err() {
                    warn!("Transport event receiver dropped, discarding event");
                }
            }
            None => {
                debug!("No transport event sender registered, discarding event");
            }
        }
    }
}

impl MqttClient {
    pub fn new(client_id: &str, config: MqttSection) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(client_id, &config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);

        Ok(MqttClient {
            client_id: client_id.to_string(),
            client: Arc::new(Mutex::new(client)),
            event_loop: Some(Mutex::new(event_loop)),
            config,
            event_loop_handle: None,
            state_rx: None,
            state_tx: None,
            shutdown_tx: None,
            shared: Arc::new(SharedState::new()),
        })
    }

    /// Create connection state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::Connecting => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Connect to the MQTT broker. Only returns success on ConnAck, not on
    /// TCP establishment.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .take()
            .ok_or_else(|| {
                MqttError::ConnectionFailedStr("Event loop already started".to_string())
            })?
            .into_inner();

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.state_tx = Some(state_tx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let client_id = self.client_id.clone();
        let shared_client = self.client.clone();
        let shared = self.shared.clone();
        let retry_interval = Duration::from_secs(self.config.retry_interval_secs);

        let handle = tokio::spawn(Self::run_event_loop(
            client_id,
            event_loop,
            shared_client,
            shared,
            state_tx,
            shutdown_rx,
            retry_interval,
        ));
        self.event_loop_handle = Some(handle);

        Self::wait_for_connection_confirmation(state_rx, CONNECT_TIMEOUT).await
    }

    async fn run_event_loop(
        client_id: String,
        mut event_loop: EventLoop,
        shared_client: Arc<Mutex<AsyncClient>>,
        shared: Arc<SharedState>,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown_rx: watch::Receiver<bool>,
        retry_interval: Duration,
    ) {
        info!("Starting MQTT event loop for client: {}", client_id);

        loop {
            tokio::select! {
                // Check for shutdown signal first (higher priority)
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                }

                event = event_loop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                            let _ = state_tx.send(ConnectionState::Connected);
                            Self::resubscribe_to_topics(&shared_client, &shared).await;

                            if epoch > 1 {
                                let pending = shared.drain_in_flight();
                                info!(
                                    pending = pending.len(),
                                    "MQTT connection re-established"
                                );
                                shared
                                    .forward(TransportEvent::Reconnected { pending })
                                    .await;
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                            debug!(topic = %topic, "Received MQTT message");
                            shared
                                .forward(TransportEvent::Message {
                                    topic,
                                    payload: publish.payload.to_vec(),
                                })
                                .await;
                        }
                        Ok(Event::Incoming(Packet::PubAck(_))) => {
                            shared.ack_in_flight();
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let was_connected =
                                matches!(*state_tx.borrow(), ConnectionState::Connected);
                            let _ = state_tx.send(ConnectionState::Disconnected(e.to_string()));

                            if was_connected {
                                error!("MQTT event loop error for {}: {}", client_id, e);
                                shared
                                    .forward(TransportEvent::Disconnected {
                                        reason: e.to_string(),
                                    })
                                    .await;
                            }

                            // rumqttc reconnects on the next poll; back off so
                            // a dead broker is not hammered in a tight loop
                            if !Self::interruptible_sleep(
                                shutdown_rx.clone(),
                                retry_interval,
                            )
                            .await
                            {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("MQTT event loop stopped for client: {}", client_id);
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnect delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(delay) => {
                true
            }
        }
    }

    /// Re-apply tracked subscriptions after a ConnAck. Clean-start sessions
    /// lose server-side subscription state on every reconnect.
    async fn resubscribe_to_topics(client: &Arc<Mutex<AsyncClient>>, shared: &Arc<SharedState>) {
        let filters = shared.subscriptions_snapshot();
        let client_guard = client.lock().await;
        for filter in filters {
            if let Err(e) = client_guard
                .subscribe(&filter, to_mqtt_qos(Qos::AtLeastOnce))
                .await
            {
                error!("Failed to re-subscribe to {}: {}", filter, e);
            } else {
                debug!(filter = %filter, "Re-subscribed");
            }
        }
    }

    /// Get current connection state
    /// Returns None if connection hasn't been established yet
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Client not connected: state_rx is None".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if current_state != ConnectionState::Connected {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }

        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        let already_connected = self.state_rx.is_some();
        if already_connected {
            let client = self.client.lock().await;
            client
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
        }

        if let Some(state_tx) = &self.state_tx {
            let _ = state_tx.send(ConnectionState::Disconnected(
                "Client disconnected".to_string(),
            ));
        }

        if let Some(handle) = self.event_loop_handle.take() {
            let graceful_shutdown = tokio::time::timeout(Duration::from_secs(2), handle).await;

            match graceful_shutdown {
                Ok(Ok(())) => {
                    info!("MQTT event loop shut down gracefully");
                }
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("MQTT event loop ended with error: {}", e);
                }
                Err(_) => {
                    warn!("MQTT event loop didn't shut down gracefully, forcing abort");
                }
                _ => {}
            }
        }

        info!("MQTT client disconnected");
        Ok(())
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), Self::Error> {
        self.check_connection_state()?;

        let client = self.client.lock().await;
        client
            .publish(topic, to_mqtt_qos(qos), false, payload.clone())
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        // Only QoS 1 deliveries are tracked: QoS 0 has no ack to wait for
        if qos == Qos::AtLeastOnce {
            self.shared.push_in_flight(topic, &payload);
        }

        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), Self::Error> {
        self.check_connection_state()?;

        let client = self.client.lock().await;
        client
            .subscribe(filter, to_mqtt_qos(qos))
            .await
            .map_err(|e| {
                MqttError::SubscriptionFailed(
                    format!("Failed to subscribe to {filter}: {e}").into(),
                )
            })?;

        self.shared.track_subscription(filter);
        info!(filter = %filter, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), Self::Error> {
        self.check_connection_state()?;

        let client = self.client.lock().await;
        client.unsubscribe(filter).await.map_err(|e| {
            MqttError::SubscriptionFailed(
                format!("Failed to unsubscribe from {filter}: {e}").into(),
            )
        })?;

        self.shared.untrack_subscription(filter);
        info!(filter = %filter, "Unsubscribed");
        Ok(())
    }

    fn set_event_sender(&self, sender: mpsc::Sender<TransportEvent>) {
        self.shared.events.lock().unwrap().replace(sender);
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // Signal shutdown to the event loop task if it's still running
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        // Abort the event loop task if it's still running; Drop cannot await
        // a graceful disconnect, callers use disconnect() for that
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}
