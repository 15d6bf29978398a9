//! Device-management protocol types
//!
//! Message payloads, response codes, and the entity-scoped topic scheme.

pub mod messages;
pub mod topics;

pub use messages::{
    DeviceData, DeviceInfo, DeviceLocation, DiagLog, DmResponse, LogSeverity, ManageBody,
    ResponseCode, SupportedActions,
};
pub use topics::{
    parse_agent_topic, parse_response_topic, parse_server_request, EntityKey, ServerRequestKind,
    TopicBuilder,
};
