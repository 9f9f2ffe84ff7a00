//! Integration tests for the MQTT client that need no running broker
//!
//! Covers client creation, offline buffering and the startup failure path
//! when the broker is unreachable.

use lockbridge::bridge::BackoffPolicy;
use lockbridge::config::{BridgeConfig, MqttSection};
use lockbridge::transport::mqtt::{BusConnectionState, MqttClient, MqttError, ReconnectConfig};
use std::time::{Duration, Instant};

fn mqtt_section(broker_url: &str) -> MqttSection {
    MqttSection {
        broker_url: broker_url.to_string(),
        username: None,
        password: None,
        username_env: None,
        password_env: None,
        client_id_prefix: "lockbridge-test".to_string(),
        keep_alive_secs: 30,
        retain_state: false,
        max_reconnect_attempts: None,
    }
}

fn quick_reconnect(max_attempts: Option<u32>) -> ReconnectConfig {
    ReconnectConfig {
        max_attempts,
        policy: BackoffPolicy::fixed_ratio(Duration::from_millis(10), Duration::from_millis(20), 2.0),
    }
}

#[tokio::test]
async fn test_mqtt_client_creation() {
    let client = MqttClient::new(
        &mqtt_section("mqtt://localhost:1883"),
        None,
        ReconnectConfig::default(),
        Duration::from_secs(5),
    )
    .expect("client creation should not touch the network");

    assert!(!client.is_connected());
    assert!(!client.is_permanently_disconnected());
    assert_eq!(client.connection_state(), None);
}

#[tokio::test]
async fn test_mqtt_client_from_bridge_config() {
    let config = BridgeConfig::from_toml_str(
        r#"
[mqtt]
broker_url = "mqtts://broker.example.com"
username = "hub"
password = "secret"

[[devices]]
address = "AA:BB:CC:DD:EE:01"
secret_key = "00112233445566778899aabbccddeeff"
"#,
    )
    .unwrap();

    let client = MqttClient::from_config(&config).unwrap();
    assert_eq!(client.connection_state(), None);
}

#[tokio::test]
async fn test_mqtt_client_rejects_invalid_broker_url() {
    let result = MqttClient::new(
        &mqtt_section("not a url"),
        None,
        ReconnectConfig::default(),
        Duration::from_secs(5),
    );
    assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
}

#[tokio::test]
async fn test_publish_before_connect_keeps_latest_state_per_topic() {
    let client = MqttClient::new(
        &mqtt_section("mqtt://localhost:1883"),
        None,
        ReconnectConfig::default(),
        Duration::from_secs(5),
    )
    .unwrap();

    client
        .publish("sesame/front/get", br#"{"lockCurrentState":"LOCKED"}"#.to_vec(), false)
        .await
        .unwrap();
    client
        .publish("sesame/front/get", br#"{"lockCurrentState":"UNLOCKED"}"#.to_vec(), false)
        .await
        .unwrap();
    client
        .publish("sesame/back/get", br#"{"lockCurrentState":"LOCKED"}"#.to_vec(), true)
        .await
        .unwrap();

    assert_eq!(client.undelivered_count(), 2);
}

#[tokio::test]
async fn test_subscribe_before_connect_is_deferred() {
    let client = MqttClient::new(
        &mqtt_section("mqtt://localhost:1883"),
        None,
        ReconnectConfig::default(),
        Duration::from_secs(5),
    )
    .unwrap();

    assert!(client.subscribe("sesame/+/set").await.is_ok());
    assert!(client.subscribe("sesame/+/set").await.is_ok());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_connect_fails_once_reconnect_budget_is_spent() {
    // Port 1 on loopback refuses connections immediately
    let client = MqttClient::new(
        &mqtt_section("mqtt://127.0.0.1:1"),
        None,
        quick_reconnect(Some(2)),
        Duration::from_secs(5),
    )
    .unwrap();

    let start = Instant::now();
    let result = client.connect().await;

    assert!(result.is_err(), "connect should fail without a broker");
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(client.is_permanently_disconnected());
    assert!(matches!(
        client
            .publish("sesame/front/get", b"{}".to_vec(), false)
            .await,
        Err(MqttError::NotConnected { .. })
    ));
}

#[tokio::test]
async fn test_connect_times_out_while_retrying_forever() {
    let client = MqttClient::new(
        &mqtt_section("mqtt://127.0.0.1:1"),
        None,
        quick_reconnect(None),
        Duration::from_millis(300),
    )
    .unwrap();

    let result = client.connect().await;

    assert!(result.is_err());
    assert!(!client.is_connected());
    assert!(!matches!(
        client.connection_state(),
        Some(BusConnectionState::Connected)
    ));
}

#[tokio::test]
async fn test_second_connect_is_rejected() {
    let client = MqttClient::new(
        &mqtt_section("mqtt://127.0.0.1:1"),
        None,
        quick_reconnect(Some(1)),
        Duration::from_secs(2),
    )
    .unwrap();

    let _ = client.connect().await;
    assert!(client.connect().await.is_err());
    assert!(client.disconnect().await.is_ok());
}

#[tokio::test]
async fn test_disconnect_without_connect_is_ok() {
    let client = MqttClient::new(
        &mqtt_section("mqtt://localhost:1883"),
        None,
        ReconnectConfig::default(),
        Duration::from_secs(5),
    )
    .unwrap();

    assert!(client.disconnect().await.is_ok());
    assert!(!client.is_connected());
}
