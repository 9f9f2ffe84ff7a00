//! Topic layout and routing of bus topics to device identities

use crate::config::{BridgeConfig, TopicMode};
use uuid::Uuid;

/// Collapse repeated slashes and drop trailing ones; a leading slash is kept
/// as given since MQTT treats `/a` and `a` as different topics.
pub fn canonicalize_topic(topic: &str) -> String {
    let mut result = topic.to_string();

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    while result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

/// Routing key for an identity taken from a topic segment
///
/// Any form a UUID parser accepts (upper case, simple, braced, urn) maps to
/// the lowercase hyphenated form; anything else is lowercased so a
/// MAC-derived identity matches regardless of case.
pub fn normalize_device_id(raw: &str) -> String {
    match Uuid::parse_str(raw) {
        Ok(uuid) => uuid.hyphenated().to_string(),
        Err(_) => raw.to_ascii_lowercase(),
    }
}

/// How device identities map onto set/get topics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicLayout {
    /// `<base>/<identity>/set` and `<base>/<identity>/get`
    PerDevice { base: String },
    /// Fixed topics bound to a single device
    Single {
        set_topic: String,
        get_topic: String,
        device_id: String,
    },
}

impl TopicLayout {
    pub fn per_device(base: &str) -> Self {
        TopicLayout::PerDevice {
            base: canonicalize_topic(base),
        }
    }

    pub fn single(set_topic: &str, get_topic: &str, device_id: impl Into<String>) -> Self {
        TopicLayout::Single {
            set_topic: canonicalize_topic(set_topic),
            get_topic: canonicalize_topic(get_topic),
            device_id: device_id.into(),
        }
    }

    /// Layout described by a validated configuration
    pub fn from_config(config: &BridgeConfig) -> Self {
        match config.topics.mode {
            TopicMode::PerDevice => Self::per_device(&config.topics.base_topic),
            TopicMode::Single => {
                let device_id = config
                    .devices
                    .first()
                    .map(crate::config::routing_identity)
                    .unwrap_or_default();
                Self::single(
                    config.topics.set_topic.as_deref().unwrap_or_default(),
                    config.topics.get_topic.as_deref().unwrap_or_default(),
                    device_id,
                )
            }
        }
    }

    /// Topic filters the bus client must subscribe to
    pub fn subscriptions(&self) -> Vec<String> {
        match self {
            TopicLayout::PerDevice { base } => vec![format!("{base}/+/set")],
            TopicLayout::Single { set_topic, .. } => vec![set_topic.clone()],
        }
    }

    /// Device identity addressed by an inbound command topic
    pub fn device_for_topic<'a>(&'a self, topic: &'a str) -> Option<&'a str> {
        match self {
            TopicLayout::PerDevice { base } => {
                let id = topic
                    .strip_prefix(base.as_str())?
                    .strip_prefix('/')?
                    .strip_suffix("/set")?;
                if id.is_empty() || id.contains('/') {
                    None
                } else {
                    Some(id)
                }
            }
            TopicLayout::Single {
                set_topic,
                device_id,
                ..
            } => (topic == set_topic).then_some(device_id.as_str()),
        }
    }

    /// Topic a device's state snapshots are published to
    pub fn state_topic(&self, device_id: &str) -> String {
        match self {
            TopicLayout::PerDevice { base } => format!("{base}/{device_id}/get"),
            TopicLayout::Single { get_topic, .. } => get_topic.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn canonicalize_topic_is_idempotent(topic in ".*") {
            let first = canonicalize_topic(&topic);
            let second = canonicalize_topic(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn canonicalize_topic_no_consecutive_slashes(topic in ".*") {
            let result = canonicalize_topic(&topic);
            prop_assert!(!result.contains("//"), "No consecutive slashes allowed: {}", result);
        }

        #[test]
        fn per_device_routes_its_own_state_topic_back(id in "[a-z0-9-]{1,36}") {
            let layout = TopicLayout::per_device("sesame");
            let set_topic = format!("sesame/{id}/set");
            prop_assert_eq!(layout.device_for_topic(&set_topic), Some(id.as_str()));
            prop_assert_eq!(layout.state_topic(&id), format!("sesame/{id}/get"));
        }
    }

    #[test]
    fn test_normalize_device_id() {
        let canonical = "6a1f2c3e-0b4d-4a5e-9f60-7182a3b4c5d6";
        assert_eq!(normalize_device_id(canonical), canonical);
        assert_eq!(
            normalize_device_id("6A1F2C3E-0B4D-4A5E-9F60-7182A3B4C5D6"),
            canonical
        );
        assert_eq!(normalize_device_id("6A1F2C3E0B4D4A5E9F607182A3B4C5D6"), canonical);
        assert_eq!(normalize_device_id("AABBCCDDEE01"), "aabbccddee01");
    }

    #[test]
    fn test_canonicalize_examples() {
        assert_eq!(canonicalize_topic("sesame//locks/"), "sesame/locks");
        assert_eq!(canonicalize_topic("/home/door"), "/home/door");
        assert_eq!(canonicalize_topic("/"), "/");
        assert_eq!(canonicalize_topic(""), "");
    }

    #[test]
    fn test_per_device_subscriptions() {
        let layout = TopicLayout::per_device("sesame/");
        assert_eq!(layout.subscriptions(), vec!["sesame/+/set".to_string()]);
    }

    #[test]
    fn test_per_device_rejects_foreign_topics() {
        let layout = TopicLayout::per_device("sesame");
        assert_eq!(layout.device_for_topic("sesame/abc/get"), None);
        assert_eq!(layout.device_for_topic("sesame//set"), None);
        assert_eq!(layout.device_for_topic("sesame/a/b/set"), None);
        assert_eq!(layout.device_for_topic("other/abc/set"), None);
        assert_eq!(layout.device_for_topic("sesameX/abc/set"), None);
    }

    #[test]
    fn test_single_layout_routing() {
        let layout = TopicLayout::single("home/door/set", "home/door/get", "front");
        assert_eq!(layout.subscriptions(), vec!["home/door/set".to_string()]);
        assert_eq!(layout.device_for_topic("home/door/set"), Some("front"));
        assert_eq!(layout.device_for_topic("home/door/get"), None);
        assert_eq!(layout.state_topic("front"), "home/door/get");
    }

    #[test]
    fn test_from_config() {
        let config = BridgeConfig::test_config();
        let layout = TopicLayout::from_config(&config);
        assert_eq!(
            layout.state_topic("6a1f2c3e-0b4d-4a5e-9f60-7182a3b4c5d6"),
            "sesame/6a1f2c3e-0b4d-4a5e-9f60-7182a3b4c5d6/get"
        );
    }
}
