//! Per-device connection states

use serde::Serialize;
use std::fmt;

/// Connection lifecycle of one lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Transport up, session not yet authenticated
    Connected,
    /// Authenticated and accepting operations
    Ready,
    /// Backoff timer pending
    Retrying,
    Closing,
}

impl ConnectionState {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Closing) => self != Closing,
            (Closing, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Retrying) => true,
            (Connected, Ready) | (Connected, Retrying) => true,
            (Ready, Retrying) => true,
            (Retrying, Connecting) => true,
            _ => false,
        }
    }

    /// Operations may only be sent to the adapter in this state
    pub fn accepts_operations(self) -> bool {
        self == ConnectionState::Ready
    }

    /// A live or pending transport the session may report lost
    pub fn has_session(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Ready
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Connecting));
    }

    #[test]
    fn test_any_state_can_close() {
        for state in [Disconnected, Connecting, Connected, Ready, Retrying] {
            assert!(state.can_transition_to(Closing), "{state} -> Closing");
        }
        assert!(!Closing.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Disconnected));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Connecting.can_transition_to(Ready));
        assert!(!Retrying.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Connecting));
        assert!(!Closing.can_transition_to(Connecting));
    }

    #[test]
    fn test_only_ready_accepts_operations() {
        for state in [Disconnected, Connecting, Connected, Retrying, Closing] {
            assert!(!state.accepts_operations());
        }
        assert!(Ready.accepts_operations());
    }
}
