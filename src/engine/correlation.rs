//! Request/response correlation over the shared response topic
//!
//! Every agent-initiated request gets a fresh `reqId` and a one-shot waiter
//! registered under it. Inbound responses are matched by `reqId` alone;
//! orphans (late, duplicate, or unknown) are logged and dropped without
//! disturbing other waiters.

use crate::engine::dispatcher::{Dispatcher, OutboundEnvelope};
use crate::error::GatewayResult;
use crate::protocol::DmResponse;
use crate::transport::Qos;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Correlates outbound requests with inbound responses by `reqId`.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, oneshot::Sender<DmResponse>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp `body` with a fresh `reqId`, enqueue it, and wait for the
    /// matching response.
    ///
    /// Returns `Ok(None)` when no response arrives within `timeout`; the
    /// waiter is deregistered so a late response is dropped as an orphan
    /// rather than resolving a future request.
    pub async fn send_and_wait(
        &self,
        dispatcher: &Dispatcher,
        topic: String,
        mut body: Value,
        timeout: Duration,
    ) -> GatewayResult<Option<DmResponse>> {
        let req_id = Uuid::new_v4().to_string();
        body["reqId"] = Value::String(req_id.clone());
        let payload = serde_json::to_vec(&body)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(req_id.clone(), tx);

        debug!(req_id = %req_id, topic = %topic, "Sending correlated request");
        dispatcher.enqueue(OutboundEnvelope {
            topic,
            payload,
            qos: Qos::AtLeastOnce,
        });

        let outcome = tokio::time::timeout(timeout, rx).await;

        // Always deregister: on timeout the sender is discarded, and on
        // success this is a no-op because resolve() already removed it.
        self.pending.lock().unwrap().remove(&req_id);

        match outcome {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => {
                // Waiter dropped without a response (engine teardown)
                debug!(req_id = %req_id, "Correlation channel closed before response");
                Ok(None)
            }
            Err(_) => {
                warn!(req_id = %req_id, "Request timed out waiting for response");
                Ok(None)
            }
        }
    }

    /// Resolve an inbound response payload against the pending waiters.
    ///
    /// Malformed payloads and orphan `reqId`s are dropped; only the first
    /// response for a given `reqId` reaches its waiter.
    pub fn resolve(&self, payload: &[u8]) {
        let response: DmResponse = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Dropping malformed response payload");
                return;
            }
        };

        let waiter = self.pending.lock().unwrap().remove(&response.req_id);
        match waiter {
            Some(tx) => {
                debug!(req_id = %response.req_id, rc = response.rc, "Resolved response");
                if tx.send(response).is_err() {
                    debug!("Waiter gone before response delivery");
                }
            }
            None => {
                debug!(req_id = %response.req_id, "Dropping orphan response");
            }
        }
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
