//! Per-device bridge state machine
//!
//! [`BridgeCore`] is pure: it consumes [`BridgeInput`]s and returns the
//! [`BridgeEffect`]s the async runner must perform. Connection attempts carry
//! an attempt number and operations a sequence number so late results from
//! an abandoned attempt are recognised and ignored.

use super::backoff::Backoff;
use super::pending::PendingSlot;
use super::state::ConnectionState;
use super::translator::{DeviceStateSnapshot, StateTranslator};
use crate::device::{LockAction, SessionError, SessionEvent};
use crate::error::sanitize_error_message;
use crate::observability::metrics::metrics;
use crate::protocol::{CommandVocabulary, LockCommand, StatePayload};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A recognised command waiting for the bridge to become ready
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub command: LockCommand,
    /// Raw payload of the bus message that carried the command
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct InFlight {
    seq: u64,
    action: LockAction,
    started: Instant,
}

/// Everything that can happen to a bridge
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeInput {
    Start,
    Command(Bytes),
    ConnectFinished {
        attempt: u32,
        result: Result<(), SessionError>,
    },
    AuthenticateFinished {
        attempt: u32,
        result: Result<(), SessionError>,
    },
    OperationFinished {
        seq: u64,
        result: Result<(), SessionError>,
    },
    Session(SessionEvent),
    RetryElapsed,
    Shutdown,
    /// Session released after shutdown
    Closed,
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEffect {
    Connect { attempt: u32 },
    Authenticate { attempt: u32 },
    Dispatch { seq: u64, action: LockAction },
    ScheduleRetry { delay: Duration },
    /// Abandon any connect or authenticate call still running
    AbortAttempt,
    /// Best-effort teardown of a half-open session before retrying
    ReleaseSession,
    CancelRetry,
    Publish(StatePayload),
    Disconnect,
}

/// Connection lifecycle and command handling for one device
#[derive(Debug)]
pub struct BridgeCore {
    device_id: String,
    state: ConnectionState,
    vocabulary: CommandVocabulary,
    translator: StateTranslator,
    backoff: Backoff,
    pending: PendingSlot<PendingOperation>,
    in_flight: Option<InFlight>,
    last_snapshot: Option<DeviceStateSnapshot>,
    attempt: u32,
    next_seq: u64,
    shutting_down: bool,
}

impl BridgeCore {
    pub fn new(
        device_id: impl Into<String>,
        vocabulary: CommandVocabulary,
        translator: StateTranslator,
        backoff: Backoff,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            state: ConnectionState::Disconnected,
            vocabulary,
            translator,
            backoff,
            pending: PendingSlot::new(),
            in_flight: None,
            last_snapshot: None,
            attempt: 0,
            next_seq: 0,
            shutting_down: false,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_snapshot(&self) -> Option<&DeviceStateSnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn pending(&self) -> Option<&PendingOperation> {
        self.pending.peek()
    }

    pub fn in_flight_action(&self) -> Option<LockAction> {
        self.in_flight.as_ref().map(|op| op.action)
    }

    /// Shut down and fully released
    pub fn is_finished(&self) -> bool {
        self.shutting_down && self.state == ConnectionState::Disconnected
    }

    /// Advance the machine by one input
    pub fn handle(&mut self, input: BridgeInput) -> Vec<BridgeEffect> {
        match input {
            BridgeInput::Start => self.on_start(),
            BridgeInput::Command(payload) => self.on_command(payload),
            BridgeInput::ConnectFinished { attempt, result } => {
                self.on_connect_finished(attempt, result)
            }
            BridgeInput::AuthenticateFinished { attempt, result } => {
                self.on_authenticate_finished(attempt, result)
            }
            BridgeInput::OperationFinished { seq, result } => {
                self.on_operation_finished(seq, result)
            }
            BridgeInput::Session(SessionEvent::Notification(notification)) => {
                self.on_notification(&notification)
            }
            BridgeInput::Session(SessionEvent::ConnectionLost(reason)) => {
                self.on_connection_lost(&reason)
            }
            BridgeInput::RetryElapsed => self.on_retry_elapsed(),
            BridgeInput::Shutdown => self.on_shutdown(),
            BridgeInput::Closed => self.on_closed(),
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            warn!(
                device = %self.device_id,
                from = %self.state,
                to = %next,
                "Refusing illegal state transition"
            );
            return;
        }
        info!(
            device = %self.device_id,
            from = %self.state,
            to = %next,
            "Connection state changed"
        );
        self.state = next;
        metrics().set_bridge_state(&self.device_id, &next.to_string());
    }

    fn begin_connect(&mut self) -> Vec<BridgeEffect> {
        self.attempt = self.attempt.wrapping_add(1);
        self.transition(ConnectionState::Connecting);
        metrics().connect_attempt();
        vec![BridgeEffect::Connect {
            attempt: self.attempt,
        }]
    }

    fn enter_retrying(&mut self, reason: &str) -> Vec<BridgeEffect> {
        if let Some(op) = self.in_flight.take() {
            warn!(
                device = %self.device_id,
                action = %op.action,
                seq = op.seq,
                "Session lost with operation in flight"
            );
            metrics().operation_completed(op.started.elapsed(), false);
        }
        let had_transport = matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Ready
        );
        self.transition(ConnectionState::Retrying);
        let delay = self.backoff.next_delay();
        metrics().retry_scheduled();
        warn!(
            device = %self.device_id,
            reason,
            retry = self.backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        let mut effects = vec![BridgeEffect::AbortAttempt];
        if had_transport {
            effects.push(BridgeEffect::ReleaseSession);
        }
        effects.push(BridgeEffect::ScheduleRetry { delay });
        effects
    }

    fn on_start(&mut self) -> Vec<BridgeEffect> {
        if self.state != ConnectionState::Disconnected || self.shutting_down {
            debug!(device = %self.device_id, state = %self.state, "Ignoring duplicate start");
            return Vec::new();
        }
        self.begin_connect()
    }

    fn on_command(&mut self, payload: Bytes) -> Vec<BridgeEffect> {
        let Some(command) = self.vocabulary.parse(&payload) else {
            debug!(
                device = %self.device_id,
                payload = %String::from_utf8_lossy(&payload),
                "Ignoring unrecognised command"
            );
            metrics().command_ignored();
            return Vec::new();
        };
        metrics().command_received();

        if self.shutting_down {
            warn!(device = %self.device_id, ?command, "Bridge closing, command discarded");
            metrics().command_discarded();
            return Vec::new();
        }

        let operation = PendingOperation {
            command,
            payload,
            received_at: Utc::now(),
        };

        if self.state.accepts_operations() && self.in_flight.is_none() {
            return self.dispatch(operation);
        }

        if let Some(superseded) = self.pending.replace(operation) {
            debug!(
                device = %self.device_id,
                superseded = ?superseded.command,
                latest = ?command,
                "Pending command superseded"
            );
            metrics().command_superseded();
        } else {
            debug!(
                device = %self.device_id,
                ?command,
                state = %self.state,
                "Command queued until ready"
            );
        }
        Vec::new()
    }

    fn dispatch(&mut self, operation: PendingOperation) -> Vec<BridgeEffect> {
        let last_known = self.last_snapshot.as_ref().map(|s| s.lock_state);
        let Some(action) = operation.command.resolve(last_known) else {
            warn!(
                device = %self.device_id,
                command = ?operation.command,
                last_known = ?last_known,
                "Cannot resolve toggle without a settled lock state"
            );
            metrics().command_rejected();
            return Vec::new();
        };

        self.next_seq = self.next_seq.wrapping_add(1);
        let seq = self.next_seq;
        self.in_flight = Some(InFlight {
            seq,
            action,
            started: Instant::now(),
        });
        info!(device = %self.device_id, %action, seq, "Dispatching operation");
        metrics().operation_dispatched();
        vec![BridgeEffect::Dispatch { seq, action }]
    }

    fn drain_pending(&mut self) -> Vec<BridgeEffect> {
        if !self.state.accepts_operations() || self.in_flight.is_some() {
            return Vec::new();
        }
        match self.pending.take() {
            Some(operation) => self.dispatch(operation),
            None => Vec::new(),
        }
    }

    fn on_connect_finished(
        &mut self,
        attempt: u32,
        result: Result<(), SessionError>,
    ) -> Vec<BridgeEffect> {
        if attempt != self.attempt || self.state != ConnectionState::Connecting {
            debug!(device = %self.device_id, attempt, "Ignoring stale connect result");
            return Vec::new();
        }
        match result {
            Ok(()) => {
                self.transition(ConnectionState::Connected);
                vec![BridgeEffect::Authenticate { attempt }]
            }
            Err(e) => {
                metrics().session_failed();
                self.enter_retrying(&sanitize_error_message(&e.to_string()))
            }
        }
    }

    fn on_authenticate_finished(
        &mut self,
        attempt: u32,
        result: Result<(), SessionError>,
    ) -> Vec<BridgeEffect> {
        if attempt != self.attempt || self.state != ConnectionState::Connected {
            debug!(device = %self.device_id, attempt, "Ignoring stale authentication result");
            return Vec::new();
        }
        match result {
            Ok(()) => {
                self.transition(ConnectionState::Ready);
                self.backoff.reset();
                metrics().session_ready();
                self.drain_pending()
            }
            Err(e) => {
                metrics().session_failed();
                self.enter_retrying(&sanitize_error_message(&e.to_string()))
            }
        }
    }

    fn on_operation_finished(
        &mut self,
        seq: u64,
        result: Result<(), SessionError>,
    ) -> Vec<BridgeEffect> {
        if self.shutting_down {
            debug!(device = %self.device_id, seq, "Discarding operation result while closing");
            return Vec::new();
        }
        if self.in_flight.as_ref().map(|op| op.seq) != Some(seq) {
            debug!(device = %self.device_id, seq, "Ignoring stale operation result");
            return Vec::new();
        }
        let Some(op) = self.in_flight.take() else {
            return Vec::new();
        };
        let elapsed = op.started.elapsed();
        match result {
            Ok(()) => {
                info!(
                    device = %self.device_id,
                    action = %op.action,
                    seq,
                    duration_ms = elapsed.as_millis() as u64,
                    "Operation acknowledged"
                );
                metrics().operation_completed(elapsed, true);
            }
            Err(e) => {
                warn!(
                    device = %self.device_id,
                    action = %op.action,
                    seq,
                    error = %e,
                    "Operation failed"
                );
                metrics().operation_completed(elapsed, false);
            }
        }
        self.drain_pending()
    }

    fn on_notification(
        &mut self,
        notification: &crate::device::RawNotification,
    ) -> Vec<BridgeEffect> {
        if self.shutting_down {
            return Vec::new();
        }
        metrics().notification_received();
        match self.translator.translate(notification) {
            Some(snapshot) => {
                debug!(
                    device = %self.device_id,
                    lock_state = %snapshot.lock_state,
                    battery = snapshot.battery_percentage,
                    "State snapshot updated"
                );
                let payload = self.translator.to_payload(&snapshot);
                self.last_snapshot = Some(snapshot);
                vec![BridgeEffect::Publish(payload)]
            }
            None => {
                metrics().notification_dropped();
                Vec::new()
            }
        }
    }

    fn on_connection_lost(&mut self, reason: &str) -> Vec<BridgeEffect> {
        if self.shutting_down || !self.state.has_session() {
            debug!(device = %self.device_id, state = %self.state, reason, "Ignoring connection loss");
            return Vec::new();
        }
        metrics().session_lost();
        self.enter_retrying(reason)
    }

    fn on_retry_elapsed(&mut self) -> Vec<BridgeEffect> {
        if self.state != ConnectionState::Retrying || self.shutting_down {
            return Vec::new();
        }
        self.begin_connect()
    }

    fn on_shutdown(&mut self) -> Vec<BridgeEffect> {
        if self.shutting_down {
            return Vec::new();
        }
        self.shutting_down = true;
        self.transition(ConnectionState::Closing);
        if let Some(operation) = self.pending.take() {
            warn!(
                device = %self.device_id,
                command = ?operation.command,
                "Discarding pending command on shutdown"
            );
            metrics().command_discarded();
        }
        if let Some(op) = self.in_flight.take() {
            debug!(
                device = %self.device_id,
                action = %op.action,
                seq = op.seq,
                "Leaving in-flight operation to finish unobserved"
            );
        }
        vec![
            BridgeEffect::CancelRetry,
            BridgeEffect::AbortAttempt,
            BridgeEffect::Disconnect,
        ]
    }

    fn on_closed(&mut self) -> Vec<BridgeEffect> {
        if self.state == ConnectionState::Closing {
            self.transition(ConnectionState::Disconnected);
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::backoff::BackoffPolicy;
    use crate::device::{MechStatus, RawNotification};
    use crate::protocol::LockState;

    fn core() -> BridgeCore {
        core_with(CommandVocabulary::default())
    }

    fn core_with(vocabulary: CommandVocabulary) -> BridgeCore {
        let policy = BackoffPolicy::fixed_ratio(
            Duration::from_millis(100),
            Duration::from_millis(1000),
            2.0,
        );
        BridgeCore::new(
            "front",
            vocabulary,
            StateTranslator::per_device(false, true),
            policy.start(),
        )
    }

    fn ready_core() -> BridgeCore {
        let mut core = core();
        core.handle(BridgeInput::Start);
        core.handle(BridgeInput::ConnectFinished {
            attempt: 1,
            result: Ok(()),
        });
        core.handle(BridgeInput::AuthenticateFinished {
            attempt: 1,
            result: Ok(()),
        });
        assert_eq!(core.state(), ConnectionState::Ready);
        core
    }

    fn command(text: &'static str) -> BridgeInput {
        BridgeInput::Command(Bytes::from_static(text.as_bytes()))
    }

    fn status(locked: bool) -> BridgeInput {
        BridgeInput::Session(SessionEvent::Notification(RawNotification::MechStatus(
            MechStatus {
                position: if locked { 0 } else { 256 },
                battery_voltage: 6.01,
                battery_percentage: 88,
                in_lock_range: locked,
                in_unlock_range: !locked,
                is_stopped: true,
                is_battery_critical: false,
            },
        )))
    }

    fn dispatched(effects: &[BridgeEffect]) -> Vec<LockAction> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                BridgeEffect::Dispatch { action, .. } => Some(*action),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_connects_then_authenticates() {
        let mut core = core();
        assert_eq!(
            core.handle(BridgeInput::Start),
            vec![BridgeEffect::Connect { attempt: 1 }]
        );
        assert_eq!(core.state(), ConnectionState::Connecting);

        let effects = core.handle(BridgeInput::ConnectFinished {
            attempt: 1,
            result: Ok(()),
        });
        assert_eq!(effects, vec![BridgeEffect::Authenticate { attempt: 1 }]);
        assert_eq!(core.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_lock_while_ready_dispatches_once() {
        let mut core = ready_core();
        let effects = core.handle(command("LOCK"));
        assert_eq!(dispatched(&effects), vec![LockAction::Lock]);
        assert_eq!(core.in_flight_action(), Some(LockAction::Lock));
        assert!(core.pending().is_none());
    }

    #[test]
    fn test_commands_queue_while_retrying_and_latest_wins() {
        let mut core = core();
        core.handle(BridgeInput::Start);
        let effects = core.handle(BridgeInput::ConnectFinished {
            attempt: 1,
            result: Err(SessionError::ConnectFailed("out of range".to_string())),
        });
        assert_eq!(core.state(), ConnectionState::Retrying);
        assert!(effects.contains(&BridgeEffect::ScheduleRetry {
            delay: Duration::from_millis(100)
        }));

        assert!(dispatched(&core.handle(command("LOCK"))).is_empty());
        assert!(dispatched(&core.handle(command("UNLOCK"))).is_empty());
        assert_eq!(core.pending().map(|p| p.command), Some(LockCommand::Unlock));

        assert_eq!(
            core.handle(BridgeInput::RetryElapsed),
            vec![BridgeEffect::Connect { attempt: 2 }]
        );
        core.handle(BridgeInput::ConnectFinished {
            attempt: 2,
            result: Ok(()),
        });
        let effects = core.handle(BridgeInput::AuthenticateFinished {
            attempt: 2,
            result: Ok(()),
        });
        assert_eq!(dispatched(&effects), vec![LockAction::Unlock]);
        assert!(core.pending().is_none());
    }

    #[test]
    fn test_commands_queue_behind_in_flight_operation() {
        let mut core = ready_core();
        core.handle(command("LOCK"));
        assert!(dispatched(&core.handle(command("UNLOCK"))).is_empty());
        assert!(dispatched(&core.handle(command("LOCK"))).is_empty());

        let effects = core.handle(BridgeInput::OperationFinished {
            seq: 1,
            result: Ok(()),
        });
        assert_eq!(dispatched(&effects), vec![LockAction::Lock]);
        assert!(matches!(
            effects.as_slice(),
            [BridgeEffect::Dispatch { seq: 2, .. }]
        ));
    }

    #[test]
    fn test_failed_operation_still_drains_queue() {
        let mut core = ready_core();
        core.handle(command("LOCK"));
        core.handle(command("UNLOCK"));
        let effects = core.handle(BridgeInput::OperationFinished {
            seq: 1,
            result: Err(SessionError::OperationFailed("nack".to_string())),
        });
        assert_eq!(dispatched(&effects), vec![LockAction::Unlock]);
    }

    #[test]
    fn test_stale_results_are_ignored() {
        let mut core = ready_core();
        core.handle(command("LOCK"));
        assert!(core
            .handle(BridgeInput::OperationFinished {
                seq: 99,
                result: Ok(()),
            })
            .is_empty());
        assert_eq!(core.in_flight_action(), Some(LockAction::Lock));

        assert!(core
            .handle(BridgeInput::ConnectFinished {
                attempt: 1,
                result: Ok(()),
            })
            .is_empty());
        assert_eq!(core.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_connection_loss_while_ready_retries_with_growing_delay() {
        let mut core = ready_core();
        core.handle(command("LOCK"));

        let effects = core.handle(BridgeInput::Session(SessionEvent::ConnectionLost(
            "peripheral disconnected".to_string(),
        )));
        assert_eq!(core.state(), ConnectionState::Retrying);
        assert_eq!(core.in_flight_action(), None);
        assert!(effects.contains(&BridgeEffect::ScheduleRetry {
            delay: Duration::from_millis(100)
        }));

        core.handle(BridgeInput::RetryElapsed);
        let effects = core.handle(BridgeInput::ConnectFinished {
            attempt: 2,
            result: Err(SessionError::ConnectFailed("timeout".to_string())),
        });
        assert!(effects.contains(&BridgeEffect::ScheduleRetry {
            delay: Duration::from_millis(200)
        }));
    }

    #[test]
    fn test_ready_resets_backoff() {
        let mut core = core();
        core.handle(BridgeInput::Start);
        core.handle(BridgeInput::ConnectFinished {
            attempt: 1,
            result: Err(SessionError::ConnectFailed("timeout".to_string())),
        });
        core.handle(BridgeInput::RetryElapsed);
        core.handle(BridgeInput::ConnectFinished {
            attempt: 2,
            result: Ok(()),
        });
        core.handle(BridgeInput::AuthenticateFinished {
            attempt: 2,
            result: Ok(()),
        });

        let effects = core.handle(BridgeInput::Session(SessionEvent::ConnectionLost(
            "gone".to_string(),
        )));
        assert!(effects.contains(&BridgeEffect::ScheduleRetry {
            delay: Duration::from_millis(100)
        }));
    }

    #[test]
    fn test_authentication_failure_never_reaches_ready() {
        let mut core = core();
        core.handle(BridgeInput::Start);
        let mut previous = Duration::ZERO;
        for attempt in 1..=6 {
            core.handle(BridgeInput::ConnectFinished {
                attempt,
                result: Ok(()),
            });
            let effects = core.handle(BridgeInput::AuthenticateFinished {
                attempt,
                result: Err(SessionError::AuthenticationFailed("bad key".to_string())),
            });
            assert_eq!(core.state(), ConnectionState::Retrying);
            let delay = effects
                .iter()
                .find_map(|effect| match effect {
                    BridgeEffect::ScheduleRetry { delay } => Some(*delay),
                    _ => None,
                })
                .unwrap();
            assert!(delay >= previous);
            previous = delay;
            core.handle(BridgeInput::RetryElapsed);
        }
        assert_eq!(previous, Duration::from_millis(1000));
    }

    #[test]
    fn test_notification_publishes_payload_and_updates_snapshot() {
        let mut core = ready_core();
        let effects = core.handle(status(true));
        let [BridgeEffect::Publish(payload)] = effects.as_slice() else {
            panic!("expected a single publish, got {effects:?}");
        };
        assert_eq!(payload.lock_current_state, "LOCKED");
        assert_eq!(
            core.last_snapshot().map(|s| s.lock_state),
            Some(LockState::Locked)
        );
    }

    #[test]
    fn test_toggle_resolves_against_last_snapshot() {
        let vocabulary = CommandVocabulary::new("S", "U", Some("T".to_string()));
        let mut core = core_with(vocabulary);
        core.handle(BridgeInput::Start);
        core.handle(BridgeInput::ConnectFinished {
            attempt: 1,
            result: Ok(()),
        });
        core.handle(BridgeInput::AuthenticateFinished {
            attempt: 1,
            result: Ok(()),
        });

        assert!(dispatched(&core.handle(command("T"))).is_empty());
        assert_eq!(core.in_flight_action(), None);

        core.handle(status(false));
        assert_eq!(dispatched(&core.handle(command("T"))), vec![LockAction::Lock]);
    }

    #[test]
    fn test_unrecognised_payload_ignored() {
        let mut core = ready_core();
        assert!(core.handle(command("OPEN SESAME")).is_empty());
        assert!(core.pending().is_none());
        assert_eq!(core.in_flight_action(), None);
    }

    #[test]
    fn test_shutdown_discards_pending_and_late_results() {
        let mut core = ready_core();
        core.handle(command("LOCK"));
        core.handle(command("UNLOCK"));

        let effects = core.handle(BridgeInput::Shutdown);
        assert_eq!(core.state(), ConnectionState::Closing);
        assert!(effects.contains(&BridgeEffect::Disconnect));
        assert!(core.pending().is_none());

        assert!(core.handle(command("LOCK")).is_empty());
        assert!(core
            .handle(BridgeInput::OperationFinished {
                seq: 1,
                result: Ok(()),
            })
            .is_empty());
        assert!(core.handle(status(true)).is_empty());

        core.handle(BridgeInput::Closed);
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(core.is_finished());
        assert!(core.handle(BridgeInput::Start).is_empty());
    }

    #[test]
    fn test_shutdown_before_start() {
        let mut core = core();
        core.handle(BridgeInput::Shutdown);
        core.handle(BridgeInput::Closed);
        assert!(core.is_finished());
    }
}
