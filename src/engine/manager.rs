//! The device-management engine
//!
//! [`DeviceManager`] owns the session registry, the request correlator, the
//! outbound dispatcher, and the handler slots, and consumes the transport
//! event channel. One instance manages the gateway entity and any number of
//! attached devices; multiple instances can coexist over separate transports.

use crate::config::GatewayConfig;
use crate::engine::correlation::Correlator;
use crate::engine::dispatcher::{Dispatcher, OutboundEnvelope};
use crate::engine::registry::{ManagementSession, SessionRegistry};
use crate::error::{GatewayError, GatewayResult};
use crate::handlers::{
    DeviceAction, DeviceActionHandler, FirmwareAction, FirmwareHandler, HandlerSlots,
};
use crate::protocol::{
    parse_response_topic, parse_server_request, DeviceData, DeviceLocation, DiagLog, EntityKey,
    ManageBody, ResponseCode, ServerRequestKind, SupportedActions, TopicBuilder,
};
use crate::transport::{Qos, Transport, TransportEvent};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the transport event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Device-management engine over a transport.
pub struct DeviceManager<T: Transport> {
    transport: Arc<T>,
    registry: SessionRegistry,
    correlator: Correlator,
    dispatcher: StdMutex<Option<Arc<Dispatcher>>>,
    handlers: HandlerSlots,
    response_subscribed: AtomicBool,
    request_timeout: Duration,
    retry_interval: Duration,
    event_task: StdMutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> DeviceManager<T> {
    /// Create the engine over a transport and start consuming its events.
    ///
    /// The transport should already be connected (or connecting); the engine
    /// registers its event channel here, so it must be created before
    /// messages of interest can arrive.
    pub fn new(transport: Arc<T>, config: &GatewayConfig) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        transport.set_event_sender(event_tx);

        let manager = Arc::new(DeviceManager {
            transport,
            registry: SessionRegistry::new(),
            correlator: Correlator::new(),
            dispatcher: StdMutex::new(None),
            handlers: HandlerSlots::new(),
            response_subscribed: AtomicBool::new(false),
            request_timeout: Duration::from_secs(config.mqtt.request_timeout_secs),
            retry_interval: Duration::from_secs(config.mqtt.retry_interval_secs),
            event_task: StdMutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        let handle = tokio::spawn(Self::run_event_loop(weak, event_rx));
        *manager.event_task.lock().unwrap() = Some(handle);

        manager
    }

    /// Consume transport events. Response resolution is fast and handled
    /// inline; reconnection recovery and handler callbacks issue correlated
    /// requests of their own, so they run on separate tasks — the event loop
    /// must stay free to deliver their responses.
    async fn run_event_loop(weak: Weak<Self>, mut event_rx: mpsc::Receiver<TransportEvent>) {
        debug!("Engine event loop started");
        while let Some(event) = event_rx.recv().await {
            let Some(manager) = weak.upgrade() else {
                break;
            };
            match event {
                TransportEvent::Message { topic, payload } => {
                    if parse_response_topic(&topic).is_some() {
                        manager.correlator.resolve(&payload);
                    } else if let Some((key, kind)) = parse_server_request(&topic) {
                        tokio::spawn(async move {
                            manager.handle_server_request(key, kind, &payload).await;
                        });
                    } else {
                        debug!(topic = %topic, "Ignoring message on unrecognized topic");
                    }
                }
                TransportEvent::Reconnected { pending } => {
                    tokio::spawn(async move {
                        manager.handle_reconnected(pending).await;
                    });
                }
                TransportEvent::Disconnected { reason } => {
                    warn!(reason = %reason, "Transport disconnected; sessions unchanged");
                }
            }
        }
        debug!("Engine event loop stopped");
    }

    /// Route a server-initiated request to the matching handler and
    /// acknowledge the outcome.
    async fn handle_server_request(&self, key: EntityKey, kind: ServerRequestKind, payload: &[u8]) {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(entity = %key, error = %e, "Dropping malformed server request");
                return;
            }
        };
        let Some(req_id) = value.get("reqId").and_then(Value::as_str).map(String::from) else {
            warn!(entity = %key, "Dropping server request without reqId");
            return;
        };
        let params = value.get("d").cloned().unwrap_or(Value::Null);

        let rc = self.dispatch_server_request(&key, kind, params).await;
        debug!(entity = %key, kind = ?kind, rc = rc.code(), "Acknowledging server request");

        let ack = json!({ "rc": rc.code(), "reqId": req_id });
        match serde_json::to_vec(&ack) {
            Ok(payload) => self.publish_or_enqueue(TopicBuilder::agent_response(&key), payload),
            Err(e) => error!(entity = %key, error = %e, "Failed to encode acknowledgement"),
        }
    }

    async fn dispatch_server_request(
        &self,
        key: &EntityKey,
        kind: ServerRequestKind,
        params: Value,
    ) -> ResponseCode {
        let session = match self.registry.get(key) {
            Some(session) if session.managed && session.handlers_attached => session,
            _ => {
                warn!(entity = %key, "Server request for entity without a management session");
                return ResponseCode::FunctionNotImplemented;
            }
        };

        match kind {
            ServerRequestKind::FirmwareDownload | ServerRequestKind::FirmwareUpdate => {
                if !session.supports.firmware_actions {
                    return ResponseCode::FunctionNotImplemented;
                }
                let Some(handler) = self.handlers.firmware() else {
                    return ResponseCode::FunctionNotImplemented;
                };
                let action = match kind {
                    ServerRequestKind::FirmwareDownload => FirmwareAction::Download,
                    _ => FirmwareAction::Update,
                };
                handler.handle(key, action, params).await
            }
            ServerRequestKind::Reboot | ServerRequestKind::FactoryReset => {
                if !session.supports.device_actions {
                    return ResponseCode::FunctionNotImplemented;
                }
                let Some(handler) = self.handlers.device_action() else {
                    return ResponseCode::FunctionNotImplemented;
                };
                let action = match kind {
                    ServerRequestKind::Reboot => DeviceAction::Reboot,
                    _ => DeviceAction::FactoryReset,
                };
                handler.handle(key, action, params).await
            }
        }
    }

    /// Restore session state after a reconnect: re-subscribe, re-announce
    /// every live session with its remaining lifetime, then replay the
    /// publishes that were unacknowledged when the connection dropped.
    async fn handle_reconnected(&self, pending: Vec<(String, Vec<u8>)>) {
        info!(
            sessions = self.registry.len(),
            pending = pending.len(),
            "Connection restored, resuming management sessions"
        );

        if self.response_subscribed.load(Ordering::SeqCst) {
            if let Err(e) = self
                .transport
                .subscribe(&TopicBuilder::response_filter(), Qos::AtLeastOnce)
                .await
            {
                error!(error = %e, "Failed to restore response subscription");
            }
        }

        let now = Utc::now();
        for session in self.registry.managed_snapshot() {
            // Failures are isolated per entity; one bad re-announce must not
            // block the rest
            if let Err(e) = self.reannounce(&session, now).await {
                error!(entity = %session.key, error = %e, "Failed to re-announce session");
            }
        }

        for (topic, payload) in pending {
            debug!(topic = %topic, "Replaying unacknowledged publish");
            if let Err(e) = self
                .transport
                .publish(&topic, payload, Qos::AtLeastOnce)
                .await
            {
                error!(topic = %topic, error = %e, "Failed to replay publish");
            }
        }
    }

    async fn reannounce(
        &self,
        session: &ManagementSession,
        now: chrono::DateTime<Utc>,
    ) -> GatewayResult<()> {
        let remaining = session.remaining_lifetime(now);
        let body = ManageBody::new(session.supports, &session.device_data, remaining);
        let dispatcher = self.ensure_dispatcher();

        let response = self
            .correlator
            .send_and_wait(
                &dispatcher,
                TopicBuilder::manage(&session.key),
                json!({ "d": body }),
                self.request_timeout,
            )
            .await?;

        match response {
            Some(r) if r.code().is_success() => {
                // The accepted re-announce starts a fresh dormancy window of
                // the remaining lifetime
                self.registry.upsert_managed(
                    session.key.clone(),
                    session.supports,
                    session.device_data.clone(),
                    remaining,
                    session.handlers_attached,
                );
                debug!(entity = %session.key, remaining, "Session re-announced");
                Ok(())
            }
            Some(r) => Err(GatewayError::internal(format!(
                "re-announce rejected with rc {}",
                r.rc
            ))),
            None => Err(GatewayError::internal("re-announce timed out")),
        }
    }

    /// Get the running dispatcher, restarting it if the previous one was
    /// shut down by an unmanage teardown.
    fn ensure_dispatcher(&self) -> Arc<Dispatcher> {
        let mut slot = self.dispatcher.lock().unwrap();
        match slot.as_ref() {
            Some(dispatcher) if !dispatcher.is_closed() => dispatcher.clone(),
            _ => {
                let dispatcher =
                    Arc::new(Dispatcher::spawn(self.transport.clone(), self.retry_interval));
                *slot = Some(dispatcher.clone());
                dispatcher
            }
        }
    }

    fn current_dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.lock().unwrap().clone()
    }

    /// Queue through the dispatcher when it is running, otherwise publish
    /// directly. Used for acknowledgements, which must go out even during
    /// teardown.
    fn publish_or_enqueue(&self, topic: String, payload: Vec<u8>) {
        match self.current_dispatcher() {
            Some(dispatcher) if !dispatcher.is_closed() => {
                dispatcher.enqueue(OutboundEnvelope {
                    topic,
                    payload,
                    qos: Qos::AtLeastOnce,
                });
            }
            _ => {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.publish(&topic, payload, Qos::AtLeastOnce).await {
                        error!(topic = %topic, error = %e, "Failed to publish acknowledgement");
                    }
                });
            }
        }
    }

    async fn ensure_response_subscription(&self) -> GatewayResult<()> {
        if self.response_subscribed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.transport
            .subscribe(&TopicBuilder::response_filter(), Qos::AtLeastOnce)
            .await
            .map_err(GatewayError::transport)?;
        self.response_subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Start (or refresh) a management session for `key`.
    ///
    /// `lifetime_secs` of zero announces an unlimited session. Returns
    /// whether the server accepted the session; a timeout or a non-200
    /// response yields `Ok(false)`.
    pub async fn manage(
        &self,
        key: EntityKey,
        supports: SupportedActions,
        device_data: DeviceData,
        lifetime_secs: u64,
    ) -> GatewayResult<bool> {
        let dispatcher = self.ensure_dispatcher();
        self.ensure_response_subscription().await?;

        let body = ManageBody::new(supports, &device_data, lifetime_secs);
        let response = self
            .correlator
            .send_and_wait(
                &dispatcher,
                TopicBuilder::manage(&key),
                json!({ "d": body }),
                self.request_timeout,
            )
            .await?;

        match response {
            Some(r) if r.code().is_success() => {
                info!(entity = %key, lifetime_secs, "Management session established");
                self.registry
                    .upsert_managed(key, supports, device_data, lifetime_secs, true);
                Ok(true)
            }
            Some(r) => {
                warn!(entity = %key, rc = r.rc, "Manage request rejected");
                Ok(false)
            }
            None => {
                warn!(entity = %key, "Manage request timed out");
                Ok(false)
            }
        }
    }

    /// End the management session for `key`.
    ///
    /// The local session entry is removed whether or not the server
    /// confirms; when the last session goes, the response subscription and
    /// the dispatcher are torn down too.
    pub async fn unmanage(&self, key: &EntityKey) -> GatewayResult<bool> {
        if !self.registry.contains(key) {
            return Err(GatewayError::not_registered(key));
        }

        let dispatcher = self.ensure_dispatcher();
        let response = self
            .correlator
            .send_and_wait(
                &dispatcher,
                TopicBuilder::unmanage(key),
                json!({}),
                self.request_timeout,
            )
            .await?;

        let accepted = match response {
            Some(r) if r.code().is_success() => true,
            Some(r) => {
                warn!(entity = %key, rc = r.rc, "Unmanage request rejected");
                false
            }
            None => {
                warn!(entity = %key, "Unmanage request timed out");
                false
            }
        };

        self.registry.remove(key);
        info!(entity = %key, accepted, "Management session removed");

        if self.registry.is_empty() {
            self.teardown().await;
        }

        Ok(accepted)
    }

    /// Tear down shared machinery once no sessions remain.
    async fn teardown(&self) {
        info!("Last management session removed, tearing down");

        if self.response_subscribed.swap(false, Ordering::SeqCst) {
            if let Err(e) = self
                .transport
                .unsubscribe(&TopicBuilder::response_filter())
                .await
            {
                error!(error = %e, "Failed to unsubscribe from response topic");
            }
        }

        if let Some(dispatcher) = self.current_dispatcher() {
            dispatcher.shutdown();
        }
    }

    /// Register an attached device without starting a management session.
    pub fn register_device(&self, key: EntityKey, device_data: DeviceData) {
        debug!(entity = %key, "Registered attached device");
        self.registry.preregister(key, device_data);
    }

    /// Report a location update for a registered entity.
    pub async fn update_location(
        &self,
        key: &EntityKey,
        location: &DeviceLocation,
    ) -> GatewayResult<Option<ResponseCode>> {
        self.send_entity_request(key, TopicBuilder::update_location(key), location.to_body())
            .await
    }

    /// Append a diagnostic error code for a registered entity.
    pub async fn add_error_code(
        &self,
        key: &EntityKey,
        error_code: i64,
    ) -> GatewayResult<Option<ResponseCode>> {
        self.send_entity_request(
            key,
            TopicBuilder::add_error_codes(key),
            json!({ "errorCode": error_code }),
        )
        .await
    }

    /// Clear all diagnostic error codes for a registered entity.
    pub async fn clear_error_codes(&self, key: &EntityKey) -> GatewayResult<Option<ResponseCode>> {
        self.send_bare_entity_request(key, TopicBuilder::clear_error_codes(key))
            .await
    }

    /// Upload a diagnostic log entry for a registered entity.
    pub async fn add_log(
        &self,
        key: &EntityKey,
        log: &DiagLog,
    ) -> GatewayResult<Option<ResponseCode>> {
        self.send_entity_request(key, TopicBuilder::add_diag_log(key), log.to_body())
            .await
    }

    /// Clear all diagnostic logs for a registered entity.
    pub async fn clear_logs(&self, key: &EntityKey) -> GatewayResult<Option<ResponseCode>> {
        self.send_bare_entity_request(key, TopicBuilder::clear_diag_logs(key))
            .await
    }

    async fn send_entity_request(
        &self,
        key: &EntityKey,
        topic: String,
        body: Value,
    ) -> GatewayResult<Option<ResponseCode>> {
        self.send_request(key, topic, json!({ "d": body })).await
    }

    /// Requests whose payload is just the correlation id (clear operations).
    async fn send_bare_entity_request(
        &self,
        key: &EntityKey,
        topic: String,
    ) -> GatewayResult<Option<ResponseCode>> {
        self.send_request(key, topic, json!({})).await
    }

    async fn send_request(
        &self,
        key: &EntityKey,
        topic: String,
        body: Value,
    ) -> GatewayResult<Option<ResponseCode>> {
        if !self.registry.contains(key) {
            return Err(GatewayError::not_registered(key));
        }

        let dispatcher = self.ensure_dispatcher();
        self.ensure_response_subscription().await?;

        let response = self
            .correlator
            .send_and_wait(&dispatcher, topic, body, self.request_timeout)
            .await?;
        Ok(response.map(|r| r.code()))
    }

    /// Attach the global firmware handler. May be called at most once.
    pub fn set_firmware_handler(&self, handler: Arc<dyn FirmwareHandler>) -> GatewayResult<()> {
        self.handlers.set_firmware(handler)
    }

    /// Attach the global device-action handler. May be called at most once.
    pub fn set_device_action_handler(
        &self,
        handler: Arc<dyn DeviceActionHandler>,
    ) -> GatewayResult<()> {
        self.handlers.set_device_action(handler)
    }

    /// Whether `key` currently has a live management session.
    pub fn is_managed(&self, key: &EntityKey) -> bool {
        self.registry.get(key).is_some_and(|s| s.managed)
    }

    /// Number of registered entities (managed or not).
    pub fn entity_count(&self) -> usize {
        self.registry.len()
    }
}

impl<T: Transport> Drop for DeviceManager<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.event_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewaySection, MqttSection};
    use crate::testing::MockTransport;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            gateway: GatewaySection {
                org: "acme".to_string(),
                type_id: "gateway".to_string(),
                device_id: "gw-1".to_string(),
                auth_token_env: None,
            },
            mqtt: MqttSection {
                broker_url: "mqtt://localhost:1883".to_string(),
                username_env: None,
                password_env: None,
                request_timeout_secs: 120,
                retry_interval_secs: 5,
                keep_alive_secs: 60,
            },
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_reannounce_refreshes_dormancy_deadline() {
        let transport = Arc::new(MockTransport::connected());
        transport.auto_respond(200);
        let manager = DeviceManager::new(transport.clone(), &test_config());
        let key = EntityKey::new("gateway", "gw-1");

        manager
            .manage(
                key.clone(),
                SupportedActions::default(),
                DeviceData::default(),
                1,
            )
            .await
            .unwrap();
        assert!(manager
            .registry
            .get(&key)
            .unwrap()
            .dormancy_deadline
            .is_some());

        // Let the one-second lifetime lapse before the reconnect: the
        // re-announce carries the clamped remaining lifetime of zero, and the
        // accepted session restarts without a deadline instead of keeping the
        // stale expired one
        tokio::time::sleep(Duration::from_millis(1200)).await;
        transport.inject_reconnected(vec![]).await;
        settle().await;

        let session = manager.registry.get(&key).unwrap();
        assert!(session.managed);
        assert!(session.dormancy_deadline.is_none());
    }

    #[tokio::test]
    async fn test_reannounce_preserves_session_attributes() {
        let transport = Arc::new(MockTransport::connected());
        transport.auto_respond(200);
        let manager = DeviceManager::new(transport.clone(), &test_config());
        let key = EntityKey::new("gateway", "gw-1");
        let supports = SupportedActions {
            device_actions: true,
            firmware_actions: false,
        };

        manager
            .manage(key.clone(), supports, DeviceData::default(), 3600)
            .await
            .unwrap();
        transport.inject_reconnected(vec![]).await;
        settle().await;

        let session = manager.registry.get(&key).unwrap();
        assert!(session.managed);
        assert!(session.handlers_attached);
        assert_eq!(session.supports, supports);
        let remaining = session.remaining_lifetime(Utc::now());
        assert!(remaining <= 3600 && remaining >= 3590, "remaining was {remaining}");
    }
}
