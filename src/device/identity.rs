//! Immutable per-lock identity

use crate::config::{routing_identity, BridgeConfig, DeviceSection};
use std::fmt;

/// Identity of one configured lock
///
/// Created from configuration at startup and never mutated.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    id: String,
    address: String,
    secret_key: String,
    history_name: String,
}

impl DeviceIdentity {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        secret_key: impl Into<String>,
        history_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            secret_key: secret_key.into(),
            history_name: history_name.into(),
        }
    }

    /// Build the identity for one `[[devices]]` entry
    pub fn from_section(device: &DeviceSection, default_history_name: &str) -> Self {
        Self::new(
            routing_identity(device),
            device.address.to_ascii_uppercase(),
            device.secret_key.to_ascii_lowercase(),
            device
                .name
                .clone()
                .unwrap_or_else(|| default_history_name.to_string()),
        )
    }

    /// All identities of a validated configuration
    pub fn all_from_config(config: &BridgeConfig) -> Vec<Self> {
        config
            .devices
            .iter()
            .map(|d| Self::from_section(d, &config.bridge.history_name))
            .collect()
    }

    /// Routing identity used in bus topics
    pub fn id(&self) -> &str {
        &self.id
    }

    /// BLE hardware address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Secret key handed to the session adapter
    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    /// Name recorded with every lock/unlock in the device history
    pub fn history_name(&self) -> &str {
        &self.history_name
    }
}

// Manual impl keeps the secret key out of logs.
impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("history_name", &self.history_name)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_uses_defaults() {
        let config = BridgeConfig::test_config();
        let identities = DeviceIdentity::all_from_config(&config);
        assert_eq!(identities.len(), 1);
        let identity = &identities[0];
        assert_eq!(identity.id(), "6a1f2c3e-0b4d-4a5e-9f60-7182a3b4c5d6");
        assert_eq!(identity.address(), "AA:BB:CC:DD:EE:01");
        assert_eq!(identity.history_name(), "lockbridge");
    }

    #[test]
    fn test_per_device_name_overrides_history_name() {
        let mut config = BridgeConfig::test_config();
        config.devices[0].name = Some("Front door".to_string());
        let identity = DeviceIdentity::from_section(&config.devices[0], "hub");
        assert_eq!(identity.history_name(), "Front door");
    }

    #[test]
    fn test_debug_hides_secret_key() {
        let identity = DeviceIdentity::new("front", "AA:BB:CC:DD:EE:01", "deadbeef", "hub");
        let debug = format!("{identity:?}");
        assert!(debug.contains("front"));
        assert!(!debug.contains("deadbeef"));
    }
}
