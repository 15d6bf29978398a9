//! Serialized outbound publisher with disconnect-tolerant retry
//!
//! All agent-initiated publishes funnel through one worker task so they leave
//! in enqueue order. The worker blocks on the head of the queue while the
//! transport is down and retries it until it goes out; nothing is dropped or
//! reordered by a connection outage.

use crate::transport::{Qos, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A publish queued for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEnvelope {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

/// Work items for the dispatcher task. The shutdown sentinel travels through
/// the same queue as publishes, so everything enqueued before it still drains.
enum DispatchItem {
    Publish(OutboundEnvelope),
    Shutdown,
}

/// Handle to the outbound dispatcher task.
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<DispatchItem>,
    /// Set as soon as the sentinel is queued, before the worker observes it,
    /// so a restart never reuses a dispatcher that is draining to exit.
    shutting_down: AtomicBool,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the dispatcher worker over the given transport.
    pub fn spawn<T: Transport>(transport: Arc<T>, retry_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::run(transport, rx, retry_interval));
        Dispatcher {
            tx,
            shutting_down: AtomicBool::new(false),
            handle: Some(handle),
        }
    }

    async fn run<T: Transport>(
        transport: Arc<T>,
        mut rx: mpsc::UnboundedReceiver<DispatchItem>,
        retry_interval: Duration,
    ) {
        debug!("Outbound dispatcher started");

        while let Some(item) = rx.recv().await {
            let envelope = match item {
                DispatchItem::Publish(envelope) => envelope,
                DispatchItem::Shutdown => {
                    info!("Outbound dispatcher shutting down");
                    break;
                }
            };

            // Retry the head of the queue until it goes out. Later items wait
            // behind it so ordering is preserved across outages.
            loop {
                if !transport.is_connected() {
                    warn!(
                        topic = %envelope.topic,
                        "Transport disconnected, retrying publish in {:?}",
                        retry_interval
                    );
                    tokio::time::sleep(retry_interval).await;
                    continue;
                }

                match transport
                    .publish(&envelope.topic, envelope.payload.clone(), envelope.qos)
                    .await
                {
                    Ok(()) => {
                        debug!(topic = %envelope.topic, "Dispatched publish");
                        break;
                    }
                    Err(e) => {
                        warn!(
                            topic = %envelope.topic,
                            error = %e,
                            "Publish failed, retrying in {:?}",
                            retry_interval
                        );
                        tokio::time::sleep(retry_interval).await;
                    }
                }
            }
        }

        debug!("Outbound dispatcher stopped");
    }

    /// Queue a publish. Fire-and-forget: enqueueing never fails, delivery is
    /// retried by the worker until the transport accepts it.
    pub fn enqueue(&self, envelope: OutboundEnvelope) {
        if self.tx.send(DispatchItem::Publish(envelope)).is_err() {
            warn!("Dispatcher queue closed, dropping outbound publish");
        }
    }

    /// Queue the shutdown sentinel. Publishes already in the queue drain
    /// first; the worker exits when it dequeues the sentinel.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if self.tx.send(DispatchItem::Shutdown).is_err() {
            debug!("Dispatcher already shut down");
        }
    }

    /// Whether this dispatcher is shut down or shutting down and must not be
    /// handed new work.
    pub fn is_closed(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.tx.send(DispatchItem::Shutdown);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
