//! Notification translation
//!
//! Raw session notifications become [`DeviceStateSnapshot`]s, and snapshots
//! become the JSON document published on a device's state topic.

use crate::config::{BridgeConfig, TopicMode};
use crate::device::{MechStatus, RawNotification};
use crate::protocol::{ChargingState, CommandVocabulary, LockState, StatePayload};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Latest known state of one lock, always complete
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStateSnapshot {
    pub position: i16,
    pub lock_state: LockState,
    pub battery_voltage: f64,
    pub battery_percentage: u8,
    pub charging_state: ChargingState,
    pub low_battery: bool,
    pub observed_at: DateTime<Utc>,
}

/// Stateless mapping between session notifications and bus payloads
#[derive(Debug, Clone, PartialEq)]
pub struct StateTranslator {
    locked_literal: String,
    unlocked_literal: String,
    publish_position: bool,
    publish_voltage: bool,
}

impl StateTranslator {
    /// Per-device layout: settled states are published as `LOCKED`/`UNLOCKED`
    pub fn per_device(publish_position: bool, publish_voltage: bool) -> Self {
        Self {
            locked_literal: LockState::Locked.as_str().to_string(),
            unlocked_literal: LockState::Unlocked.as_str().to_string(),
            publish_position,
            publish_voltage,
        }
    }

    /// Single-topic layout: settled states echo the command literals
    pub fn echoing(vocabulary: &CommandVocabulary, publish_position: bool, publish_voltage: bool) -> Self {
        Self {
            locked_literal: vocabulary.lock_literal().to_string(),
            unlocked_literal: vocabulary.unlock_literal().to_string(),
            publish_position,
            publish_voltage,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        let topics = &config.topics;
        match topics.mode {
            TopicMode::PerDevice => Self::per_device(topics.publish_position, topics.publish_voltage),
            TopicMode::Single => Self::echoing(
                &CommandVocabulary::from_section(&config.command_section()),
                topics.publish_position,
                topics.publish_voltage,
            ),
        }
    }

    /// Lock state implied by a mechanical status report
    pub fn derive_lock_state(status: &MechStatus) -> LockState {
        if !status.is_stopped {
            LockState::Moving
        } else if status.in_lock_range {
            LockState::Locked
        } else if status.in_unlock_range {
            LockState::Unlocked
        } else {
            LockState::Unknown
        }
    }

    /// Snapshot for a notification, or `None` when it carries no usable state
    pub fn translate(&self, notification: &RawNotification) -> Option<DeviceStateSnapshot> {
        match notification {
            RawNotification::MechStatus(status) => {
                if status.battery_percentage > 100 || !status.battery_voltage.is_finite() {
                    warn!(
                        battery_percentage = status.battery_percentage,
                        battery_voltage = status.battery_voltage,
                        "Discarding malformed mech status"
                    );
                    return None;
                }
                Some(DeviceStateSnapshot {
                    position: status.position,
                    lock_state: Self::derive_lock_state(status),
                    battery_voltage: status.battery_voltage,
                    battery_percentage: status.battery_percentage,
                    charging_state: ChargingState::NotChargeable,
                    low_battery: status.is_battery_critical,
                    observed_at: Utc::now(),
                })
            }
            RawNotification::Unsupported { item_code } => {
                debug!(item_code, "Ignoring unsupported notification");
                None
            }
        }
    }

    /// Wire document for a snapshot
    pub fn to_payload(&self, snapshot: &DeviceStateSnapshot) -> StatePayload {
        let lock_current_state = match snapshot.lock_state {
            LockState::Locked => self.locked_literal.clone(),
            LockState::Unlocked => self.unlocked_literal.clone(),
            other => other.as_str().to_string(),
        };
        StatePayload {
            lock_current_state,
            position: self.publish_position.then_some(snapshot.position),
            battery_level: snapshot.battery_percentage,
            battery_voltage: self.publish_voltage.then_some(snapshot.battery_voltage),
            charging_state: snapshot.charging_state,
            status_low_battery: snapshot.low_battery,
        }
    }
}
