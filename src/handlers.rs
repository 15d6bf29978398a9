//! Handler traits for server-initiated management requests
//!
//! Applications attach at most one firmware handler and one device-action
//! handler; both are global across all managed entities, with the target
//! entity passed to every invocation. Setting a handler twice is a
//! programming error and is rejected.

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{EntityKey, ResponseCode};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Firmware actions the server can initiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareAction {
    Download,
    Update,
}

/// Device lifecycle actions the server can initiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Reboot,
    FactoryReset,
}

/// Application hook for firmware download/update requests.
#[async_trait]
pub trait FirmwareHandler: Send + Sync + 'static {
    /// Handle a firmware request for `entity`. The returned code is
    /// acknowledged back to the server.
    async fn handle(&self, entity: &EntityKey, action: FirmwareAction, params: Value)
        -> ResponseCode;
}

/// Application hook for reboot/factory-reset requests.
#[async_trait]
pub trait DeviceActionHandler: Send + Sync + 'static {
    async fn handle(&self, entity: &EntityKey, action: DeviceAction, params: Value)
        -> ResponseCode;
}

/// Set-once slots for the two global handlers.
#[derive(Default)]
pub struct HandlerSlots {
    firmware: Mutex<Option<Arc<dyn FirmwareHandler>>>,
    device_action: Mutex<Option<Arc<dyn DeviceActionHandler>>>,
}

impl HandlerSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_firmware(&self, handler: Arc<dyn FirmwareHandler>) -> GatewayResult<()> {
        let mut slot = self.firmware.lock().unwrap();
        if slot.is_some() {
            return Err(GatewayError::handler_already_set("firmware"));
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn set_device_action(&self, handler: Arc<dyn DeviceActionHandler>) -> GatewayResult<()> {
        let mut slot = self.device_action.lock().unwrap();
        if slot.is_some() {
            return Err(GatewayError::handler_already_set("device action"));
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn firmware(&self) -> Option<Arc<dyn FirmwareHandler>> {
        self.firmware.lock().unwrap().clone()
    }

    pub fn device_action(&self) -> Option<Arc<dyn DeviceActionHandler>> {
        self.device_action.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopFirmware;

    #[async_trait]
    impl FirmwareHandler for NoopFirmware {
        async fn handle(&self, _: &EntityKey, _: FirmwareAction, _: Value) -> ResponseCode {
            ResponseCode::Success
        }
    }

    struct NoopDeviceAction;

    #[async_trait]
    impl DeviceActionHandler for NoopDeviceAction {
        async fn handle(&self, _: &EntityKey, _: DeviceAction, _: Value) -> ResponseCode {
            ResponseCode::Accepted
        }
    }

    #[test]
    fn test_handlers_start_unset() {
        let slots = HandlerSlots::new();
        assert!(slots.firmware().is_none());
        assert!(slots.device_action().is_none());
    }

    #[test]
    fn test_second_set_is_rejected() {
        let slots = HandlerSlots::new();
        assert!(slots.set_firmware(Arc::new(NoopFirmware)).is_ok());

        let err = slots.set_firmware(Arc::new(NoopFirmware)).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::HandlerAlreadySet { kind: "firmware" }
        ));

        // First registration is untouched
        assert!(slots.firmware().is_some());
    }

    #[test]
    fn test_slots_are_independent() {
        let slots = HandlerSlots::new();
        slots.set_firmware(Arc::new(NoopFirmware)).unwrap();
        assert!(slots.set_device_action(Arc::new(NoopDeviceAction)).is_ok());
        assert!(slots.set_device_action(Arc::new(NoopDeviceAction)).is_err());
    }

    #[tokio::test]
    async fn test_handler_invocation() {
        let slots = HandlerSlots::new();
        slots.set_device_action(Arc::new(NoopDeviceAction)).unwrap();

        let handler = slots.device_action().unwrap();
        let rc = handler
            .handle(
                &EntityKey::new("gw", "g1"),
                DeviceAction::Reboot,
                Value::Null,
            )
            .await;
        assert_eq!(rc, ResponseCode::Accepted);
    }
}
