//! Outbound dispatch durability across connection outages
//!
//! Requests issued while the transport is down must not be lost or
//! reordered; they go out once the connection returns.

use iotdm_gateway::config::{GatewayConfig, GatewaySection, MqttSection};
use iotdm_gateway::engine::DeviceManager;
use iotdm_gateway::protocol::{
    DeviceData, DiagLog, EntityKey, LogSeverity, ResponseCode, SupportedActions,
};
use iotdm_gateway::testing::MockTransport;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> GatewayConfig {
    GatewayConfig {
        gateway: GatewaySection {
            org: "acme".to_string(),
            type_id: "gateway".to_string(),
            device_id: "gw-1".to_string(),
            auth_token_env: None,
        },
        mqtt: MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            request_timeout_secs: 120,
            retry_interval_secs: 5,
            keep_alive_secs: 60,
        },
    }
}

fn gateway_key() -> EntityKey {
    EntityKey::new("gateway", "gw-1")
}

async fn managed_gateway(
    transport: &Arc<MockTransport>,
) -> Arc<DeviceManager<MockTransport>> {
    transport.auto_respond(200);
    let manager = DeviceManager::new(transport.clone(), &test_config());
    let accepted = manager
        .manage(
            gateway_key(),
            SupportedActions::default(),
            DeviceData::default(),
            0,
        )
        .await
        .unwrap();
    assert!(accepted);
    manager
}

#[tokio::test(start_paused = true)]
async fn test_request_issued_while_disconnected_completes_after_reconnect() {
    let transport = Arc::new(MockTransport::connected());
    let manager = managed_gateway(&transport).await;
    let before = transport.published().len();

    transport.set_connected(false);

    let handle = {
        let manager = manager.clone();
        let key = gateway_key();
        tokio::spawn(async move { manager.add_error_code(&key, 7).await.unwrap() })
    };

    // Several retry intervals pass with the transport down and nothing leaves
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(transport.published().len(), before);
    assert!(!handle.is_finished());

    // Connection returns; the queued request goes out and resolves
    transport.set_connected(true);
    let rc = handle.await.unwrap();
    assert_eq!(rc, Some(ResponseCode::Success));

    let requests = transport.published_on("iotdevice-1/type/gateway/id/gw-1/add/diag/errorCodes");
    assert_eq!(requests.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_outage_preserves_request_order() {
    let transport = Arc::new(MockTransport::connected());
    let manager = managed_gateway(&transport).await;
    let before = transport.published().len();

    transport.set_connected(false);

    let first = {
        let manager = manager.clone();
        let key = gateway_key();
        tokio::spawn(async move {
            manager
                .add_log(&key, &DiagLog::new("first", LogSeverity::Informational))
                .await
                .unwrap()
        })
    };
    // Give the first call time to enqueue before the second
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = {
        let manager = manager.clone();
        let key = gateway_key();
        tokio::spawn(async move { manager.add_error_code(&key, 9).await.unwrap() })
    };

    tokio::time::sleep(Duration::from_secs(6)).await;
    transport.set_connected(true);

    assert_eq!(first.await.unwrap(), Some(ResponseCode::Success));
    assert_eq!(second.await.unwrap(), Some(ResponseCode::Success));

    let after: Vec<String> = transport
        .published()
        .into_iter()
        .skip(before)
        .map(|(topic, _, _)| topic)
        .collect();
    assert_eq!(
        after,
        vec![
            "iotdevice-1/type/gateway/id/gw-1/add/diag/log".to_string(),
            "iotdevice-1/type/gateway/id/gw-1/add/diag/errorCodes".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_dispatcher_restarts_after_full_teardown() {
    let transport = Arc::new(MockTransport::connected());
    let manager = managed_gateway(&transport).await;

    // Unmanaging the last entity tears the dispatcher down
    assert!(manager.unmanage(&gateway_key()).await.unwrap());
    assert_eq!(manager.entity_count(), 0);
    assert_eq!(
        transport.unsubscriptions(),
        vec!["iotdm-1/type/+/id/+/response".to_string()]
    );

    // A fresh manage spins everything back up
    let accepted = manager
        .manage(
            gateway_key(),
            SupportedActions::default(),
            DeviceData::default(),
            0,
        )
        .await
        .unwrap();
    assert!(accepted);
    assert!(manager.is_managed(&gateway_key()));
}

#[tokio::test]
async fn test_unmanage_unknown_entity_is_rejected() {
    let transport = Arc::new(MockTransport::connected());
    let manager = DeviceManager::new(transport.clone(), &test_config());

    let result = manager.unmanage(&EntityKey::new("gw", "missing")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_unmanage_removes_session_even_when_rejected() {
    let transport = Arc::new(MockTransport::connected());
    let manager = managed_gateway(&transport).await;

    transport.auto_respond(500);
    let accepted = manager.unmanage(&gateway_key()).await.unwrap();

    assert!(!accepted);
    assert!(!manager.is_managed(&gateway_key()));
    assert_eq!(manager.entity_count(), 0);
}
