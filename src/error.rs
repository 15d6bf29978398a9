//! Error types for the device-management gateway agent
//!
//! Transport-transient and protocol-timeout conditions are absorbed inside the
//! engine (see the engine modules); only protocol rejections and programming
//! contract violations cross the public API boundary as errors.

use thiserror::Error;

/// Main error type for gateway device-management operations
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{kind} handler is already set; only one global handler of each kind is allowed")]
    HandlerAlreadySet { kind: &'static str },

    #[error("entity {entity} is not registered with the management engine")]
    NotRegistered { entity: String },

    #[error("Transport error: {0}")]
    Transport(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a contract-violation error for a double handler registration
    pub fn handler_already_set(kind: &'static str) -> Self {
        Self::HandlerAlreadySet { kind }
    }

    /// Create a contract-violation error for an operation against an unknown entity
    pub fn not_registered(entity: impl std::fmt::Display) -> Self {
        Self::NotRegistered {
            entity: entity.to_string(),
        }
    }

    /// Wrap an opaque transport error
    pub fn transport<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Transport(Box::new(err))
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_already_set_display() {
        let err = GatewayError::handler_already_set("firmware");
        assert!(err.to_string().contains("firmware handler is already set"));
    }

    #[test]
    fn test_not_registered_display() {
        let err = GatewayError::not_registered("thermostat:t-042");
        assert!(matches!(err, GatewayError::NotRegistered { .. }));
        assert!(err.to_string().contains("thermostat:t-042"));
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{broken").unwrap_err();
        let err: GatewayError = json_err.into();
        assert!(matches!(err, GatewayError::Serialization(_)));
    }

    #[test]
    fn test_internal_error_constructor() {
        let err = GatewayError::internal("unexpected state");
        assert_eq!(err.to_string(), "Internal error: unexpected state");
    }
}
