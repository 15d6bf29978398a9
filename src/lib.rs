//! Device-management gateway agent
//!
//! An MQTT agent through which a gateway manages itself and its attached
//! devices against a device-management server.
//!
//! # Overview
//!
//! This crate provides:
//! - Management session lifecycle (manage/unmanage) for the gateway and any
//!   number of attached devices over one shared connection
//! - Correlated request/response exchange with per-request timeouts
//! - A serialized outbound dispatcher that survives connection outages
//!   without dropping or reordering publishes
//! - Session resumption after reconnects, re-announcing live sessions with
//!   their remaining lifetime
//! - Routing of server-initiated firmware and device-action requests to
//!   application handlers
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use iotdm_gateway::config::GatewayConfig;
//! use iotdm_gateway::engine::DeviceManager;
//! use iotdm_gateway::protocol::{DeviceData, EntityKey, SupportedActions};
//! use iotdm_gateway::transport::{MqttTransport, Transport};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::load_from_file(Path::new("gateway.toml"))?;
//!
//! let mut transport = MqttTransport::new(&config.client_id(), config.mqtt.clone())?;
//! transport.connect().await?;
//!
//! let manager = DeviceManager::new(Arc::new(transport), &config);
//!
//! // Manage the gateway itself with a one-hour lifetime
//! let gateway = EntityKey::new(&config.gateway.type_id, &config.gateway.device_id);
//! let accepted = manager
//!     .manage(
//!         gateway,
//!         SupportedActions { device_actions: true, firmware_actions: false },
//!         DeviceData::default(),
//!         3600,
//!     )
//!     .await?;
//! assert!(accepted);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::GatewayConfig;
pub use engine::DeviceManager;
pub use error::{GatewayError, GatewayResult};
pub use handlers::{DeviceAction, DeviceActionHandler, FirmwareAction, FirmwareHandler};
pub use protocol::{
    DeviceData, DeviceInfo, DeviceLocation, DiagLog, EntityKey, LogSeverity, ResponseCode,
    SupportedActions,
};
pub use testing::MockTransport;
pub use transport::{MqttTransport, Qos, Transport, TransportEvent};
