//! Device session adapter contract
//!
//! A session owns the BLE connection, the encrypted login and the command
//! encoding for one lock. The bridge drives it through [`DeviceSession`] and
//! observes it through the [`SessionEvent`] broadcast stream.

use super::identity::DeviceIdentity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Lock operation sent to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockAction {
    Lock,
    Unlock,
}

impl fmt::Display for LockAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockAction::Lock => write!(f, "lock"),
            LockAction::Unlock => write!(f, "unlock"),
        }
    }
}

/// Mechanical status reported by the lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MechStatus {
    /// Thumb-turn position in device units
    pub position: i16,
    /// Battery voltage in volts
    pub battery_voltage: f64,
    /// Battery charge, 0-100
    pub battery_percentage: u8,
    pub in_lock_range: bool,
    pub in_unlock_range: bool,
    /// False while the motor is turning
    pub is_stopped: bool,
    pub is_battery_critical: bool,
}

/// Raw notification as emitted by the session adapter
#[derive(Debug, Clone, PartialEq)]
pub enum RawNotification {
    MechStatus(MechStatus),
    /// Any notification item the bridge does not interpret
    Unsupported { item_code: u8 },
}

/// Asynchronous events from a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Notification(RawNotification),
    /// Peripheral disconnect or transport error after connect
    ConnectionLost(String),
}

/// Session adapter errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("Transport connect failed: {0}")]
    ConnectFailed(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Operation failed: {0}")]
    OperationFailed(String),
    #[error("Session not connected")]
    NotConnected,
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
}

/// One lock's BLE session
///
/// Implementations must be cheap to share: the bridge holds an `Arc` and
/// calls `send_operation` from a spawned task while continuing to process
/// events.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Establish the transport connection
    async fn connect(&self) -> Result<(), SessionError>;

    /// Perform the login/registration handshake on a connected transport
    async fn authenticate(&self) -> Result<(), SessionError>;

    /// Send a lock or unlock; resolves when the device acknowledges
    async fn send_operation(
        &self,
        action: LockAction,
        history_name: &str,
    ) -> Result<(), SessionError>;

    /// Release the transport
    async fn disconnect(&self) -> Result<(), SessionError>;

    /// Subscribe to status notifications and connection-lost events
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}

/// Creates the session for a configured lock
pub trait SessionFactory: Send + Sync {
    fn create(&self, identity: &DeviceIdentity) -> Result<Arc<dyn DeviceSession>, SessionError>;
}
