//! lockbridge
//!
//! Bridges Bluetooth LE smart locks to an MQTT broker. Each configured lock
//! gets its own bridge task that keeps an authenticated session alive,
//! executes lock/unlock commands received on `<base>/<identity>/set` and
//! publishes the lock's state as JSON on `<base>/<identity>/get`.
//!
//! # Overview
//!
//! - [`bridge`] - per-device state machine, reconnect backoff, supervisor
//! - [`device`] - session adapter contract and the simulated backend
//! - [`protocol`] - topics, command vocabulary and state payloads
//! - [`transport`] - MQTT client
//! - [`lifecycle`] - wiring of transport, supervisor and sessions
//!
//! # Quick Start
//!
//! ```rust
//! use lockbridge::protocol::{CommandVocabulary, LockCommand, TopicLayout};
//!
//! let layout = TopicLayout::per_device("sesame");
//! assert_eq!(layout.device_for_topic("sesame/front/set"), Some("front"));
//! assert_eq!(layout.state_topic("front"), "sesame/front/get");
//!
//! let vocabulary = CommandVocabulary::default();
//! assert_eq!(vocabulary.parse(b"LOCK"), Some(LockCommand::Lock));
//! ```

pub mod bridge;
pub mod config;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use bridge::{BridgeSupervisor, ConnectionState, ShutdownReport};
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, BridgeResult};
pub use lifecycle::{BridgeLifecycle, LifecycleError};
pub use transport::mqtt::MqttClient;
