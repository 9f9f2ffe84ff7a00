//! Configuration system for the lock bridge
//!
//! Loads the TOML configuration consumed by the bridge supervisor: broker
//! connection, topic layout, command vocabulary, reconnect policy and the set
//! of configured locks.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

static MAC_ADDRESS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").ok());

static SECRET_KEY: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{32}$").ok());

/// Main bridge configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub topics: TopicSection,
    /// Command literals; defaults depend on `topics.mode`
    pub commands: Option<CommandSection>,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub session: SessionSection,
    pub devices: Vec<DeviceSection>,
}

/// General bridge behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSection {
    /// Name recorded in the lock's operation history
    #[serde(default = "default_history_name")]
    pub history_name: String,
    /// Upper bound for all bridges to reach `Disconnected` on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Upper bound for a single transport connect attempt
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            history_name: default_history_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_history_name() -> String {
    "lockbridge".to_string()
}

fn default_shutdown_timeout() -> u64 {
    20
}

fn default_connect_timeout() -> u64 {
    30
}

/// MQTT broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Inline username (takes precedence over `username_env`)
    pub username: Option<String>,
    /// Inline password
    pub password: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Publish state messages with the retain flag
    #[serde(default)]
    pub retain_state: bool,
    /// Give up on the broker after this many failed reconnects (None = never)
    pub max_reconnect_attempts: Option<u32>,
}

fn default_client_id_prefix() -> String {
    "lockbridge".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

/// Topic addressing mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TopicMode {
    /// `<base>/<identity>/set` and `<base>/<identity>/get`
    #[default]
    PerDevice,
    /// Fixed set/get topics for a single lock
    Single,
}

/// Topic section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicSection {
    #[serde(default)]
    pub mode: TopicMode,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    pub set_topic: Option<String>,
    pub get_topic: Option<String>,
    #[serde(default = "default_true")]
    pub publish_position: bool,
    #[serde(default = "default_true")]
    pub publish_voltage: bool,
}

impl Default for TopicSection {
    fn default() -> Self {
        Self {
            mode: TopicMode::PerDevice,
            base_topic: default_base_topic(),
            set_topic: None,
            get_topic: None,
            publish_position: true,
            publish_voltage: true,
        }
    }
}

fn default_base_topic() -> String {
    "lockbridge".to_string()
}

fn default_true() -> bool {
    true
}

/// Command literal vocabulary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandSection {
    pub lock: String,
    pub unlock: String,
    pub toggle: Option<String>,
}

impl CommandSection {
    /// Vocabulary used when `[commands]` is absent
    pub fn default_for(mode: TopicMode) -> Self {
        match mode {
            TopicMode::PerDevice => Self {
                lock: "LOCK".to_string(),
                unlock: "UNLOCK".to_string(),
                toggle: None,
            },
            TopicMode::Single => Self {
                lock: "S".to_string(),
                unlock: "U".to_string(),
                toggle: Some("T".to_string()),
            },
        }
    }
}

/// Reconnect backoff section, shared by device bridges and the MQTT client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the base delay added as random jitter (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

/// Device session backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackend {
    /// In-process lock emulator
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default)]
    pub backend: SessionBackend,
    #[serde(default = "default_sim_connect_latency")]
    pub connect_latency_ms: u64,
    #[serde(default = "default_sim_travel_time")]
    pub travel_time_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            backend: SessionBackend::Simulated,
            connect_latency_ms: default_sim_connect_latency(),
            travel_time_ms: default_sim_travel_time(),
        }
    }
}

fn default_sim_connect_latency() -> u64 {
    200
}

fn default_sim_travel_time() -> u64 {
    800
}

/// One configured lock
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// BLE hardware address, `AA:BB:CC:DD:EE:FF`
    pub address: String,
    /// 16-byte secret key, hex encoded
    pub secret_key: String,
    /// Stable logical identifier used in topics
    pub uuid: Option<String>,
    /// Per-device history name, falls back to `bridge.history_name`
    pub name: Option<String>,
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
    #[error("Invalid device {address}: {reason}")]
    InvalidDevice { address: String, reason: String },
    #[error("Duplicate device identity: {0}")]
    DuplicateDevice(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Effective command vocabulary for the configured topic mode
    pub fn command_section(&self) -> CommandSection {
        self.commands
            .clone()
            .unwrap_or_else(|| CommandSection::default_for(self.topics.mode))
    }

    /// Validate cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one [[devices]] entry is required".to_string(),
            ));
        }

        let mut identities = HashSet::new();
        for device in &self.devices {
            validate_device(device)?;
            let identity = routing_identity(device);
            if !identities.insert(identity.clone()) {
                return Err(ConfigError::DuplicateDevice(identity));
            }
        }

        match self.topics.mode {
            TopicMode::PerDevice => {
                let base = self.topics.base_topic.trim_matches('/');
                if base.is_empty() || base.contains(['+', '#']) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "base_topic '{}' must be non-empty and free of wildcards",
                        self.topics.base_topic
                    )));
                }
            }
            TopicMode::Single => {
                if self.devices.len() != 1 {
                    return Err(ConfigError::InvalidConfig(format!(
                        "single topic mode requires exactly one device, found {}",
                        self.devices.len()
                    )));
                }
                if self.topics.set_topic.is_none() || self.topics.get_topic.is_none() {
                    return Err(ConfigError::InvalidConfig(
                        "single topic mode requires set_topic and get_topic".to_string(),
                    ));
                }
            }
        }

        let commands = self.command_section();
        let mut literals = vec![commands.lock.as_str(), commands.unlock.as_str()];
        if let Some(toggle) = &commands.toggle {
            literals.push(toggle.as_str());
        }
        if literals.iter().any(|l| l.trim().is_empty()) {
            return Err(ConfigError::InvalidConfig(
                "command literals must not be empty".to_string(),
            ));
        }
        let unique: HashSet<_> = literals.iter().collect();
        if unique.len() != literals.len() {
            return Err(ConfigError::InvalidConfig(
                "command literals must be distinct".to_string(),
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_delay_ms == 0 || reconnect.max_delay_ms < reconnect.initial_delay_ms
        {
            return Err(ConfigError::InvalidConfig(
                "reconnect delays must satisfy 0 < initial_delay_ms <= max_delay_ms".to_string(),
            ));
        }
        if reconnect.multiplier < 1.0 || !(0.0..=1.0).contains(&reconnect.jitter) {
            return Err(ConfigError::InvalidConfig(
                "reconnect multiplier must be >= 1.0 and jitter within 0.0..=1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// MQTT username: inline value first, then the named environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        self.mqtt
            .username
            .clone()
            .or_else(|| Self::get_env_var_optional(self.mqtt.username_env.as_ref()))
    }

    /// MQTT password: inline value first, then the named environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        self.mqtt
            .password
            .clone()
            .or_else(|| Self::get_env_var_optional(self.mqtt.password_env.as_ref()))
    }

    /// Copy of this configuration with secrets masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.mqtt.password.is_some() {
            copy.mqtt.password = Some("***".to_string());
        }
        for device in &mut copy.devices {
            device.secret_key = "***".to_string();
        }
        copy
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[topics]
base_topic = "sesame"

[[devices]]
address = "AA:BB:CC:DD:EE:01"
secret_key = "00112233445566778899aabbccddeeff"
uuid = "6a1f2c3e-0b4d-4a5e-9f60-7182a3b4c5d6"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Routing identity for a configured device: uuid if present, else the
/// lowercased hardware address without separators
pub fn routing_identity(device: &DeviceSection) -> String {
    match device.uuid.as_deref().map(Uuid::parse_str) {
        Some(Ok(uuid)) => uuid.hyphenated().to_string(),
        _ => device.address.to_ascii_lowercase().replace(':', ""),
    }
}

fn validate_device(device: &DeviceSection) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidDevice {
        address: device.address.clone(),
        reason: reason.to_string(),
    };

    let address_ok = MAC_ADDRESS
        .as_ref()
        .is_some_and(|re| re.is_match(&device.address));
    if !address_ok {
        return Err(invalid("address must look like AA:BB:CC:DD:EE:FF"));
    }

    let key_ok = SECRET_KEY
        .as_ref()
        .is_some_and(|re| re.is_match(&device.secret_key));
    if !key_ok {
        return Err(invalid("secret_key must be 32 hex characters"));
    }

    if let Some(uuid) = &device.uuid {
        Uuid::parse_str(uuid).map_err(|e| invalid(&format!("uuid is invalid: {e}")))?;
    }

    Ok(())
}
