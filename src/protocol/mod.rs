//! Bus-side protocol: topics, command literals and the state payload schema
//!
//! Home-automation consumers only ever see these topic/payload pairs; the
//! lock's native protocol stays behind the device session.

pub mod commands;
pub mod messages;
pub mod topics;

pub use commands::{CommandVocabulary, LockCommand};
pub use messages::{ChargingState, InboundMessage, LockState, StatePayload};
pub use topics::{canonicalize_topic, normalize_device_id, TopicLayout};
