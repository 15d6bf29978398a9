//! Device-management message types
//!
//! Payload structures exchanged with the management server. Requests carry a
//! `d` body plus a correlation `reqId`; responses carry the echoed `reqId` and
//! a status code `rc`.

use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status codes returned by the management server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success,
    Accepted,
    UpdateSuccess,
    BadRequest,
    NotFound,
    InternalError,
    FunctionNotImplemented,
    /// Any code outside the documented set is carried through untouched.
    Other(u16),
}

impl ResponseCode {
    pub fn from_rc(rc: u16) -> Self {
        match rc {
            200 => ResponseCode::Success,
            202 => ResponseCode::Accepted,
            204 => ResponseCode::UpdateSuccess,
            400 => ResponseCode::BadRequest,
            404 => ResponseCode::NotFound,
            500 => ResponseCode::InternalError,
            501 => ResponseCode::FunctionNotImplemented,
            other => ResponseCode::Other(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            ResponseCode::Success => 200,
            ResponseCode::Accepted => 202,
            ResponseCode::UpdateSuccess => 204,
            ResponseCode::BadRequest => 400,
            ResponseCode::NotFound => 404,
            ResponseCode::InternalError => 500,
            ResponseCode::FunctionNotImplemented => 501,
            ResponseCode::Other(code) => *code,
        }
    }

    /// `rc == 200` is the only code that counts as a successful manage/unmanage.
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseCode::Success)
    }
}

/// A correlated response from the management server.
///
/// Extra fields in the payload are ignored; a payload missing `reqId` or `rc`
/// never becomes a `DmResponse` (it is dropped upstream).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DmResponse {
    #[serde(rename = "reqId")]
    pub req_id: String,
    pub rc: u16,
}

impl DmResponse {
    pub fn code(&self) -> ResponseCode {
        ResponseCode::from_rc(self.rc)
    }
}

/// Capability flags advertised in a manage request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedActions {
    #[serde(rename = "deviceActions")]
    pub device_actions: bool,
    #[serde(rename = "firmwareActions")]
    pub firmware_actions: bool,
}

/// Static device description sent with a manage request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "serialNumber", skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(rename = "deviceClass", skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "fwVersion", skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
    #[serde(rename = "hwVersion", skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,
    #[serde(rename = "descriptiveLocation", skip_serializing_if = "Option::is_none")]
    pub descriptive_location: Option<String>,
}

/// Opaque per-entity data carried into manage requests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceData {
    pub device_info: Option<DeviceInfo>,
    pub metadata: Option<Value>,
}

/// Body of a manage request (`d` object).
///
/// `lifetime` is present only when positive; a zero lifetime means the session
/// never dormantizes and the field is omitted from the wire payload.
#[derive(Debug, Clone, Serialize)]
pub struct ManageBody {
    pub supports: SupportedActions,
    #[serde(rename = "deviceInfo", skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<u64>,
}

impl ManageBody {
    pub fn new(supports: SupportedActions, data: &DeviceData, lifetime_secs: u64) -> Self {
        Self {
            supports,
            device_info: data.device_info.clone(),
            metadata: data.metadata.clone(),
            lifetime: if lifetime_secs > 0 {
                Some(lifetime_secs)
            } else {
                None
            },
        }
    }
}

/// Geographic position reported through a location update.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: Option<f64>,
    pub measured_at: DateTime<Utc>,
    pub accuracy: Option<f64>,
}

impl DeviceLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation: None,
            measured_at: Utc::now(),
            accuracy: None,
        }
    }

    pub fn to_body(&self) -> Value {
        let mut body = serde_json::json!({
            "latitude": self.latitude,
            "longitude": self.longitude,
            "measuredDateTime": self.measured_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        if let Some(elevation) = self.elevation {
            body["elevation"] = elevation.into();
        }
        if let Some(accuracy) = self.accuracy {
            body["accuracy"] = accuracy.into();
        }
        body
    }
}

/// Severity of a diagnostic log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Informational,
    Warning,
    Error,
}

impl LogSeverity {
    pub fn severity(&self) -> u8 {
        match self {
            LogSeverity::Informational => 0,
            LogSeverity::Warning => 1,
            LogSeverity::Error => 2,
        }
    }
}

/// A diagnostic log entry uploaded to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagLog {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: LogSeverity,
    /// Optional diagnostic data; base64-encoded on the wire.
    pub data: Option<String>,
}

impl DiagLog {
    pub fn new(message: impl Into<String>, severity: LogSeverity) -> Self {
        Self {
            message: message.into(),
            timestamp: Utc::now(),
            severity,
            data: None,
        }
    }

    pub fn to_body(&self) -> Value {
        let mut body = serde_json::json!({
            "message": self.message,
            "severity": self.severity.severity(),
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        if let Some(data) = &self.data {
            let encoded = base64::engine::general_purpose::STANDARD.encode(data.as_bytes());
            body["data"] = encoded.into();
        }
        body
    }
}
