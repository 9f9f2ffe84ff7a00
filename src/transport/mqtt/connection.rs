//! Pure connection state management for the MQTT client
//!
//! Connection states, error types, broker options and reconnect settings.

use crate::bridge::BackoffPolicy;
use crate::config::{BridgeConfig, MqttSection};
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Connection state of the broker link
#[derive(Debug, Clone, PartialEq)]
pub enum BusConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Connected and subscribed
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Reconnect budget exhausted
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    pub policy: BackoffPolicy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            policy: BackoffPolicy::default(),
        }
    }
}

impl ReconnectConfig {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_attempts: config.mqtt.max_reconnect_attempts,
            policy: BackoffPolicy::from_section(&config.reconnect),
        }
    }

    /// Upper bound on the time spent reconnecting, ignoring jitter.
    /// Returns None if unlimited retries are configured.
    pub fn max_total_time(&self) -> Option<Duration> {
        self.max_attempts
            .map(|max_attempts| (1..=max_attempts).map(|a| self.policy.base_delay(a)).sum())
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: BusConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Broker credentials resolved from inline values or the environment
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_config(config: &BridgeConfig) -> Option<Self> {
        config.get_mqtt_username().map(|username| Self {
            username,
            password: config.get_mqtt_password().unwrap_or_default(),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Unique client identifier so a restarted bridge never collides with a
/// session the broker still holds
pub fn generate_client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..8])
}

/// Broker options from the `[mqtt]` section
pub fn configure_mqtt_options(
    config: &MqttSection,
    credentials: Option<&Credentials>,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let client_id = generate_client_id(&config.client_id_prefix);
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_clean_start(true);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mqtt_config() -> MqttSection {
        BridgeConfig::test_config().mqtt
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.max_total_time(), None);
    }

    #[test]
    fn test_max_total_time() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            policy: BackoffPolicy::fixed_ratio(
                Duration::from_millis(100),
                Duration::from_millis(250),
                2.0,
            ),
        };
        assert_eq!(config.max_total_time(), Some(Duration::from_millis(550)));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = test_mqtt_config();
        let options = configure_mqtt_options(&config, None).unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert!(options.client_id().starts_with("lockbridge-"));
    }

    #[test]
    fn test_mqtts_default_port() {
        let mut config = test_mqtt_config();
        config.broker_url = "mqtts://broker.example.com".to_string();
        let options = configure_mqtt_options(&config, None).unwrap();
        assert_eq!(options.broker_address().1, 8883);
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_mqtt_config();
        config.broker_url = "invalid-url".to_string();

        let result = configure_mqtt_options(&config, None);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(generate_client_id("lockbridge"), generate_client_id("lockbridge"));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials {
            username: "hub".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{credentials:?}");
        assert!(debug.contains("hub"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::InvalidBrokerUrl("test".to_string()),
            MqttError::NotConnected {
                state: BusConnectionState::Disconnected("test".to_string()),
            },
            MqttError::ConnectionFailedStr("test".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
