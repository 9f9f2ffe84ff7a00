//! Pure reconnection logic for the MQTT client
//!
//! Reconnect decisions, connection state transitions and the logging that
//! goes with them. The broker link shares [`Backoff`] with the device
//! bridges so both back off the same way.

use super::connection::{BusConnectionState, ReconnectConfig};
use crate::bridge::Backoff;
use std::time::Duration;
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted
    ///
    /// Supports unlimited retries when `max_attempts` is None. The returned
    /// delay comes from `backoff`, which advances by one step.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        max_attempts: Option<u32>,
        shutdown_requested: bool,
        backoff: &mut Backoff,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay: backoff.next_delay(),
        }
    }

    /// How long `connect` waits for the first ConnAck
    pub fn calculate_connection_timeout(config: &ReconnectConfig, floor: Duration) -> Duration {
        match config.max_total_time() {
            Some(total) => total.saturating_add(floor),
            None => floor,
        }
    }

    /// Determine next state after connection event
    pub fn determine_next_state(event: ConnectionEvent) -> BusConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => BusConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                BusConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => BusConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => {
                BusConnectionState::Reconnecting(attempt)
            }
            ConnectionEvent::PermanentFailure(reason) => {
                BusConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Publishing goes to the broker only in this state; otherwise it is buffered
    pub fn can_publish(state: &BusConnectionState) -> bool {
        matches!(state, BusConnectionState::Connected)
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &BusConnectionState, to: &BusConnectionState) {
        match (from, to) {
            (BusConnectionState::Connecting, BusConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (BusConnectionState::Connected, BusConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (_, BusConnectionState::Reconnecting(attempt)) => {
                info!(attempt, "Starting MQTT reconnection attempt");
            }
            (BusConnectionState::Reconnecting(_), BusConnectionState::Connected) => {
                info!("MQTT reconnection successful");
            }
            (_, BusConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "MQTT connection permanently failed");
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Validate reconnection configuration
    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }
        if config.policy.base_delay(1).is_zero() {
            return Err("initial reconnect delay must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Permanent failure - no more retries
    PermanentFailure(String),
}
