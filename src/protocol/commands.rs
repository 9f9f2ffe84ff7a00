//! Command vocabulary for inbound control messages

use super::messages::LockState;
use crate::config::CommandSection;
use crate::device::LockAction;

/// Command recognised on a set topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockCommand {
    Lock,
    Unlock,
    Toggle,
}

impl LockCommand {
    /// Resolve to a concrete device operation against the last known state.
    ///
    /// Toggle only resolves from a settled LOCKED or UNLOCKED state. It is
    /// rejected while MOVING as well as for UNKNOWN or a missing snapshot.
    /// The snapshot may be stale, which is accepted.
    pub fn resolve(self, last_known: Option<LockState>) -> Option<LockAction> {
        match self {
            LockCommand::Lock => Some(LockAction::Lock),
            LockCommand::Unlock => Some(LockAction::Unlock),
            LockCommand::Toggle => match last_known {
                Some(LockState::Locked) => Some(LockAction::Unlock),
                Some(LockState::Unlocked) => Some(LockAction::Lock),
                Some(LockState::Moving) | Some(LockState::Unknown) | None => None,
            },
        }
    }
}

/// Literal payloads mapped to commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandVocabulary {
    lock: String,
    unlock: String,
    toggle: Option<String>,
}

impl CommandVocabulary {
    pub fn new(lock: impl Into<String>, unlock: impl Into<String>, toggle: Option<String>) -> Self {
        Self {
            lock: lock.into(),
            unlock: unlock.into(),
            toggle,
        }
    }

    pub fn from_section(section: &CommandSection) -> Self {
        Self::new(
            section.lock.trim(),
            section.unlock.trim(),
            section.toggle.as_ref().map(|t| t.trim().to_string()),
        )
    }

    /// Parse a raw payload; anything unrecognised (including non-UTF-8) is `None`
    pub fn parse(&self, payload: &[u8]) -> Option<LockCommand> {
        let text = std::str::from_utf8(payload).ok()?.trim();
        if text == self.lock {
            Some(LockCommand::Lock)
        } else if text == self.unlock {
            Some(LockCommand::Unlock)
        } else if self.toggle.as_deref() == Some(text) {
            Some(LockCommand::Toggle)
        } else {
            None
        }
    }

    pub fn lock_literal(&self) -> &str {
        &self.lock
    }

    pub fn unlock_literal(&self) -> &str {
        &self.unlock
    }
}

impl Default for CommandVocabulary {
    fn default() -> Self {
        Self::new("LOCK", "UNLOCK", None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_vocabulary() {
        let vocabulary = CommandVocabulary::default();
        assert_eq!(vocabulary.parse(b"LOCK"), Some(LockCommand::Lock));
        assert_eq!(vocabulary.parse(b"UNLOCK\n"), Some(LockCommand::Unlock));
        assert_eq!(vocabulary.parse(b"lock"), None);
        assert_eq!(vocabulary.parse(b"TOGGLE"), None);
        assert_eq!(vocabulary.parse(b""), None);
        assert_eq!(vocabulary.parse(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_parse_legacy_vocabulary() {
        let vocabulary = CommandVocabulary::new("S", "U", Some("T".to_string()));
        assert_eq!(vocabulary.parse(b"S"), Some(LockCommand::Lock));
        assert_eq!(vocabulary.parse(b"U"), Some(LockCommand::Unlock));
        assert_eq!(vocabulary.parse(b"T"), Some(LockCommand::Toggle));
        assert_eq!(vocabulary.parse(b"X"), None);
    }

    #[test]
    fn test_toggle_resolution() {
        assert_eq!(
            LockCommand::Toggle.resolve(Some(LockState::Locked)),
            Some(LockAction::Unlock)
        );
        assert_eq!(
            LockCommand::Toggle.resolve(Some(LockState::Unlocked)),
            Some(LockAction::Lock)
        );
        assert_eq!(LockCommand::Toggle.resolve(Some(LockState::Unknown)), None);
        assert_eq!(LockCommand::Toggle.resolve(Some(LockState::Moving)), None);
        assert_eq!(LockCommand::Toggle.resolve(None), None);
    }

    #[test]
    fn test_explicit_commands_ignore_state() {
        assert_eq!(LockCommand::Lock.resolve(None), Some(LockAction::Lock));
        assert_eq!(
            LockCommand::Unlock.resolve(Some(LockState::Unlocked)),
            Some(LockAction::Unlock)
        );
    }
}
