//! MQTT client for the bus side of the bridge
//!
//! This module separates pure functions from I/O operations for
//! testability.
//!
//! # Architecture
//!
//! - [`connection`] - Pure connection state management and configuration
//! - [`message_handler`] - Pure message routing and processing logic
//! - [`health_monitor`] - Pure reconnection decisions
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use lockbridge::config::BridgeConfig;
//! use lockbridge::transport::mqtt::MqttClient;
//! use std::path::Path;
//!
//! # tokio_test::block_on(async {
//! let config = BridgeConfig::load_from_file(Path::new("lockbridge.toml"))?;
//! let client = MqttClient::from_config(&config)?;
//! client.connect().await?;
//! client.subscribe("sesame/+/set").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

// Re-export public types for convenience
pub use client::MqttClient;
pub use connection::{
    configure_mqtt_options, BusConnectionState, Credentials, MqttError, ReconnectConfig,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{topic_matches, EventRoute, MessageForwarder, MessageHandler};
