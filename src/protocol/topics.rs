//! Topic construction and parsing for the device-management protocol
//!
//! Agent-initiated requests go out on entity-scoped `iotdevice-1/...` topics;
//! the server answers every request on the matching `iotdm-1/.../response`
//! topic, which the engine covers with a single wildcard subscription.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix for topics the agent publishes on.
const AGENT_PREFIX: &str = "iotdevice-1";
/// Prefix for topics the server publishes on.
const SERVER_PREFIX: &str = "iotdm-1";

/// Unique key of a managed entity: the gateway itself or an attached device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub type_id: String,
    pub device_id: String,
}

impl EntityKey {
    pub fn new(type_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id, self.device_id)
    }
}

/// Server-initiated management request kinds the engine demultiplexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRequestKind {
    FirmwareDownload,
    FirmwareUpdate,
    Reboot,
    FactoryReset,
}

/// Entity-scoped topic construction.
pub struct TopicBuilder;

impl TopicBuilder {
    fn agent(key: &EntityKey, suffix: &str) -> String {
        format!(
            "{AGENT_PREFIX}/type/{}/id/{}/{suffix}",
            key.type_id, key.device_id
        )
    }

    pub fn manage(key: &EntityKey) -> String {
        Self::agent(key, "mgmt/manage")
    }

    pub fn unmanage(key: &EntityKey) -> String {
        Self::agent(key, "mgmt/unmanage")
    }

    pub fn update_location(key: &EntityKey) -> String {
        Self::agent(key, "device/update/location")
    }

    pub fn add_error_codes(key: &EntityKey) -> String {
        Self::agent(key, "add/diag/errorCodes")
    }

    pub fn clear_error_codes(key: &EntityKey) -> String {
        Self::agent(key, "clear/diag/errorCodes")
    }

    pub fn add_diag_log(key: &EntityKey) -> String {
        Self::agent(key, "add/diag/log")
    }

    pub fn clear_diag_logs(key: &EntityKey) -> String {
        Self::agent(key, "clear/diag/log")
    }

    pub fn notify(key: &EntityKey) -> String {
        Self::agent(key, "notify")
    }

    /// Topic the agent answers server-initiated requests on.
    pub fn agent_response(key: &EntityKey) -> String {
        Self::agent(key, "response")
    }

    /// Topic the server answers a specific entity's requests on.
    pub fn server_response(key: &EntityKey) -> String {
        format!(
            "{SERVER_PREFIX}/type/{}/id/{}/response",
            key.type_id, key.device_id
        )
    }

    /// Wildcard filter covering every entity's response topic.
    pub fn response_filter() -> String {
        format!("{SERVER_PREFIX}/type/+/id/+/response")
    }
}

/// Split an entity-scoped topic into its key and trailing operation path.
///
/// Expects `<prefix>/type/<typeId>/id/<deviceId>/<rest...>`.
fn split_entity_topic<'a>(topic: &'a str, prefix: &str) -> Option<(EntityKey, &'a str)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/type/")?;
    let (type_id, rest) = rest.split_once("/id/")?;
    let (device_id, op) = rest.split_once('/')?;
    if type_id.is_empty() || device_id.is_empty() || op.is_empty() {
        return None;
    }
    Some((EntityKey::new(type_id, device_id), op))
}

/// Parse an agent-published topic into its entity key and operation path.
pub fn parse_agent_topic(topic: &str) -> Option<(EntityKey, &str)> {
    split_entity_topic(topic, AGENT_PREFIX)
}

/// Parse a server response topic into the entity it belongs to.
pub fn parse_response_topic(topic: &str) -> Option<EntityKey> {
    let (key, op) = split_entity_topic(topic, SERVER_PREFIX)?;
    (op == "response").then_some(key)
}

/// Parse a server-initiated management request topic.
pub fn parse_server_request(topic: &str) -> Option<(EntityKey, ServerRequestKind)> {
    let (key, op) = split_entity_topic(topic, SERVER_PREFIX)?;
    let kind = match op {
        "mgmt/initiate/firmware/download" => ServerRequestKind::FirmwareDownload,
        "mgmt/initiate/firmware/update" => ServerRequestKind::FirmwareUpdate,
        "mgmt/initiate/device/reboot" => ServerRequestKind::Reboot,
        "mgmt/initiate/device/factory_reset" => ServerRequestKind::FactoryReset,
        _ => return None,
    };
    Some((key, kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_agent_topic_shapes() {
        let key = EntityKey::new("thermostat", "t-042");
        assert_eq!(
            TopicBuilder::manage(&key),
            "iotdevice-1/type/thermostat/id/t-042/mgmt/manage"
        );
        assert_eq!(
            TopicBuilder::unmanage(&key),
            "iotdevice-1/type/thermostat/id/t-042/mgmt/unmanage"
        );
        assert_eq!(
            TopicBuilder::update_location(&key),
            "iotdevice-1/type/thermostat/id/t-042/device/update/location"
        );
        assert_eq!(
            TopicBuilder::add_diag_log(&key),
            "iotdevice-1/type/thermostat/id/t-042/add/diag/log"
        );
    }

    #[test]
    fn test_response_filter_matches_entity_response_topic() {
        assert_eq!(TopicBuilder::response_filter(), "iotdm-1/type/+/id/+/response");
        let key = EntityKey::new("gw", "gw-1");
        assert_eq!(
            TopicBuilder::server_response(&key),
            "iotdm-1/type/gw/id/gw-1/response"
        );
    }

    #[test]
    fn test_parse_response_topic() {
        let key = parse_response_topic("iotdm-1/type/gw/id/gw-1/response").unwrap();
        assert_eq!(key, EntityKey::new("gw", "gw-1"));

        assert!(parse_response_topic("iotdm-1/type/gw/id/gw-1/observe").is_none());
        assert!(parse_response_topic("iotdevice-1/type/gw/id/gw-1/response").is_none());
        assert!(parse_response_topic("iotdm-1/type//id/gw-1/response").is_none());
    }

    #[test]
    fn test_parse_agent_topic() {
        let (key, op) = parse_agent_topic("iotdevice-1/type/gw/id/g1/mgmt/manage").unwrap();
        assert_eq!(key, EntityKey::new("gw", "g1"));
        assert_eq!(op, "mgmt/manage");
        assert!(parse_agent_topic("iotdm-1/type/gw/id/g1/response").is_none());
    }

    #[test]
    fn test_parse_server_request_kinds() {
        let cases = [
            (
                "iotdm-1/type/gw/id/g1/mgmt/initiate/firmware/download",
                ServerRequestKind::FirmwareDownload,
            ),
            (
                "iotdm-1/type/gw/id/g1/mgmt/initiate/firmware/update",
                ServerRequestKind::FirmwareUpdate,
            ),
            (
                "iotdm-1/type/gw/id/g1/mgmt/initiate/device/reboot",
                ServerRequestKind::Reboot,
            ),
            (
                "iotdm-1/type/gw/id/g1/mgmt/initiate/device/factory_reset",
                ServerRequestKind::FactoryReset,
            ),
        ];
        for (topic, expected) in cases {
            let (key, kind) = parse_server_request(topic).unwrap();
            assert_eq!(key, EntityKey::new("gw", "g1"));
            assert_eq!(kind, expected);
        }
        assert!(parse_server_request("iotdm-1/type/gw/id/g1/response").is_none());
    }

    proptest! {
        #[test]
        fn parse_inverts_build_for_response_topics(
            type_id in "[a-zA-Z0-9._-]{1,32}",
            device_id in "[a-zA-Z0-9._-]{1,32}",
        ) {
            let key = EntityKey::new(type_id, device_id);
            let topic = TopicBuilder::server_response(&key);
            prop_assert_eq!(parse_response_topic(&topic), Some(key));
        }

        #[test]
        fn agent_topics_never_parse_as_server_topics(
            type_id in "[a-zA-Z0-9._-]{1,32}",
            device_id in "[a-zA-Z0-9._-]{1,32}",
        ) {
            let key = EntityKey::new(type_id, device_id);
            prop_assert!(parse_response_topic(&TopicBuilder::manage(&key)).is_none());
            prop_assert!(parse_server_request(&TopicBuilder::manage(&key)).is_none());
        }
    }
}
