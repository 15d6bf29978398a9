//! Configuration for the gateway agent
//!
//! TOML configuration with a `[gateway]` identity section and an `[mqtt]`
//! transport section. Secrets are referenced by environment variable name and
//! resolved at runtime, never stored in the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level agent configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub gateway: GatewaySection,
    pub mqtt: MqttSection,
}

/// Identity of the gateway entity itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    /// Organization identifier
    pub org: String,
    /// Gateway type identifier (must match [a-zA-Z0-9._-]+)
    pub type_id: String,
    /// Gateway device identifier (must match [a-zA-Z0-9._-]+)
    pub device_id: String,
    /// Environment variable containing the authentication token
    pub auth_token_env: Option<String>,
}

/// MQTT transport section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL with protocol and port (mqtt:// or mqtts://)
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// How long a correlated request waits for its response (default: 120s)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Backoff between dispatcher publish retries (default: 5s)
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// MQTT keep-alive interval (default: 60s)
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_retry_interval_secs() -> u64 {
    5
}

fn default_keep_alive_secs() -> u64 {
    60
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl GatewayConfig {
    /// Load configuration from a TOML file, validating identifiers.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate identifier formats.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier(&self.gateway.org)?;
        validate_identifier(&self.gateway.type_id)?;
        validate_identifier(&self.gateway.device_id)?;
        Ok(())
    }

    /// MQTT client identifier for this gateway.
    pub fn client_id(&self) -> String {
        format!(
            "g:{}:{}:{}",
            self.gateway.org, self.gateway.type_id, self.gateway.device_id
        )
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get the authentication token from its environment variable.
    pub fn get_auth_token(&self) -> Result<String, ConfigError> {
        let name = self
            .gateway
            .auth_token_env
            .as_ref()
            .ok_or_else(|| ConfigError::EnvVarNotFound("auth_token_env".to_string()))?;
        std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.clone()))
    }

    /// Get the MQTT username from its environment variable.
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get the MQTT password from its environment variable.
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }
}

/// Validate an org/type/device identifier.
fn validate_identifier(id: &str) -> Result<(), ConfigError> {
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidIdentifier(format!(
            "'{id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
