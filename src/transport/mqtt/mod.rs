//! MQTT implementation of the transport abstraction
//!
//! Split into pure connection state management ([`connection`]) and the
//! impure rumqttc integration ([`client`]).

pub mod client;
pub mod connection;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError};
