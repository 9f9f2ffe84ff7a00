//! Transport layer for the bus side of the bridge
//!
//! This module provides the transport abstraction and the MQTT
//! implementation used to receive commands and publish lock state.

use crate::protocol::InboundMessage;
use tokio::sync::mpsc;

pub mod mqtt;

/// Publishing half of a transport
///
/// Device bridges only ever publish, so they depend on this narrower trait.
#[async_trait::async_trait]
pub trait BusPublisher: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
        -> Result<(), Self::Error>;
}

/// Transport trait for bus communication
///
/// This trait provides an abstraction over the broker client to enable
/// dependency injection and testing.
#[async_trait::async_trait]
pub trait Transport: BusPublisher {
    /// Connect to the broker and wait for acknowledgement
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Disconnect from the broker
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Subscribe to a topic filter; kept across reconnects
    async fn subscribe(&self, topic_filter: &str) -> Result<(), Self::Error>;

    /// Set the sender inbound messages are forwarded to
    async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>);

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> Option<mqtt::BusConnectionState>;

    /// Check if the connection is permanently disconnected
    fn is_permanently_disconnected(&self) -> bool;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
