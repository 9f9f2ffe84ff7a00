//! In-process lock emulator
//!
//! Behaves like a lock reachable over BLE: connects after a latency, reports
//! its mechanical status after login, and turns the thumb-turn (reporting a
//! moving status first) on every operation. Login is refused for the
//! all-zero key a lock carries before it is registered.

use super::identity::DeviceIdentity;
use super::session::{
    DeviceSession, LockAction, MechStatus, RawNotification, SessionError, SessionEvent,
    SessionFactory,
};
use crate::config::SessionSection;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

const LOCKED_POSITION: i16 = 0;
const UNLOCKED_POSITION: i16 = 256;
const BATTERY_VOLTAGE: f64 = 6.01;
const BATTERY_PERCENTAGE: u8 = 88;

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    authenticated: bool,
    locked: bool,
}

/// Emulated lock session
pub struct SimulatedLock {
    address: String,
    secret_key: String,
    connect_latency: Duration,
    travel_time: Duration,
    state: Mutex<SimState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SimulatedLock {
    pub fn new(
        address: impl Into<String>,
        secret_key: impl Into<String>,
        connect_latency: Duration,
        travel_time: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            address: address.into(),
            secret_key: secret_key.into(),
            connect_latency,
            travel_time,
            state: Mutex::new(SimState {
                locked: true,
                ..Default::default()
            }),
            events,
        }
    }

    /// Whether the emulated bolt is currently thrown
    pub fn is_locked(&self) -> bool {
        self.with_state(|s| s.locked)
    }

    /// Drop the link as if the peripheral went out of range
    pub fn drop_connection(&self, reason: &str) {
        self.with_state(|s| {
            s.connected = false;
            s.authenticated = false;
        });
        let _ = self
            .events
            .send(SessionEvent::ConnectionLost(reason.to_string()));
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        // A poisoned lock only means a panicking test thread; keep the data.
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn key_is_registered(&self) -> bool {
        !self.secret_key.is_empty() && self.secret_key.bytes().any(|b| b != b'0')
    }

    fn status(locked: bool, moving: bool) -> MechStatus {
        MechStatus {
            position: if locked {
                LOCKED_POSITION
            } else {
                UNLOCKED_POSITION
            },
            battery_voltage: BATTERY_VOLTAGE,
            battery_percentage: BATTERY_PERCENTAGE,
            in_lock_range: locked && !moving,
            in_unlock_range: !locked && !moving,
            is_stopped: !moving,
            is_battery_critical: false,
        }
    }

    fn emit_status(&self, status: MechStatus) {
        let _ = self
            .events
            .send(SessionEvent::Notification(RawNotification::MechStatus(
                status,
            )));
    }
}

impl fmt::Debug for SimulatedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedLock")
            .field("address", &self.address)
            .field("connect_latency", &self.connect_latency)
            .field("travel_time", &self.travel_time)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DeviceSession for SimulatedLock {
    async fn connect(&self) -> Result<(), SessionError> {
        tokio::time::sleep(self.connect_latency).await;
        self.with_state(|s| s.connected = true);
        debug!(address = %self.address, "Simulated transport connected");
        Ok(())
    }

    async fn authenticate(&self) -> Result<(), SessionError> {
        if !self.key_is_registered() {
            return Err(SessionError::AuthenticationFailed(
                "secret key rejected by lock".to_string(),
            ));
        }
        let locked = self.with_state(|s| {
            if s.connected {
                s.authenticated = true;
                Ok(s.locked)
            } else {
                Err(SessionError::NotConnected)
            }
        })?;
        self.emit_status(Self::status(locked, false));
        Ok(())
    }

    async fn send_operation(
        &self,
        action: LockAction,
        history_name: &str,
    ) -> Result<(), SessionError> {
        let was_locked = self.with_state(|s| {
            if s.authenticated {
                Ok(s.locked)
            } else {
                Err(SessionError::NotConnected)
            }
        })?;
        debug!(address = %self.address, %action, history_name, "Simulated operation");

        let target_locked = action == LockAction::Lock;
        if was_locked != target_locked {
            self.emit_status(Self::status(was_locked, true));
            tokio::time::sleep(self.travel_time).await;
        }

        let still_connected = self.with_state(|s| {
            if s.authenticated {
                s.locked = target_locked;
            }
            s.authenticated
        });
        if !still_connected {
            return Err(SessionError::OperationFailed(
                "connection lost during operation".to_string(),
            ));
        }
        self.emit_status(Self::status(target_locked, false));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.with_state(|s| {
            s.connected = false;
            s.authenticated = false;
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Factory for the `simulated` session backend
#[derive(Debug, Clone)]
pub struct SimulatedSessionFactory {
    connect_latency: Duration,
    travel_time: Duration,
}

impl SimulatedSessionFactory {
    pub fn new(connect_latency: Duration, travel_time: Duration) -> Self {
        Self {
            connect_latency,
            travel_time,
        }
    }

    pub fn from_section(section: &SessionSection) -> Self {
        Self::new(
            Duration::from_millis(section.connect_latency_ms),
            Duration::from_millis(section.travel_time_ms),
        )
    }
}

impl SessionFactory for SimulatedSessionFactory {
    fn create(&self, identity: &DeviceIdentity) -> Result<Arc<dyn DeviceSession>, SessionError> {
        Ok(Arc::new(SimulatedLock::new(
            identity.address(),
            identity.secret_key(),
            self.connect_latency,
            self.travel_time,
        )))
    }
}
