//! Message types exchanged over the bus

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock state as published on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    Locked,
    Unlocked,
    Moving,
    Unknown,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Locked => "LOCKED",
            LockState::Unlocked => "UNLOCKED",
            LockState::Moving => "MOVING",
            LockState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Charging state; this lock model runs on primary cells only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargingState {
    #[default]
    NotChargeable,
}

/// JSON document published on the state topic
///
/// Optional fields are omitted entirely when the topic layout disables them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePayload {
    pub lock_current_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i16>,
    pub battery_level: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_voltage: Option<f64>,
    pub charging_state: ChargingState,
    pub status_low_battery: bool,
}

impl StatePayload {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Message delivered by the bus client on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_payload_serializes_camel_case() {
        let payload = StatePayload {
            lock_current_state: "LOCKED".to_string(),
            position: Some(-12),
            battery_level: 88,
            battery_voltage: Some(6.01),
            charging_state: ChargingState::NotChargeable,
            status_low_battery: false,
        };

        let value: Value = serde_json::from_slice(&payload.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "lockCurrentState": "LOCKED",
                "position": -12,
                "batteryLevel": 88,
                "batteryVoltage": 6.01,
                "chargingState": "NOT_CHARGEABLE",
                "statusLowBattery": false
            })
        );
    }

    #[test]
    fn test_optional_fields_omitted() {
        let payload = StatePayload {
            lock_current_state: "U".to_string(),
            position: None,
            battery_level: 40,
            battery_voltage: None,
            charging_state: ChargingState::default(),
            status_low_battery: true,
        };

        let value: Value = serde_json::from_slice(&payload.to_json().unwrap()).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("position"));
        assert!(!object.contains_key("batteryVoltage"));
        assert_eq!(object["statusLowBattery"], json!(true));
    }

    #[test]
    fn test_lock_state_strings() {
        assert_eq!(LockState::Locked.to_string(), "LOCKED");
        assert_eq!(LockState::Moving.as_str(), "MOVING");
        assert_eq!(
            serde_json::to_string(&LockState::Unknown).unwrap(),
            "\"UNKNOWN\""
        );
    }
}
