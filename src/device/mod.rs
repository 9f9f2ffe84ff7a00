//! Device-side collaborators
//!
//! The bridge core never speaks the lock's BLE protocol. It talks to a
//! [`DeviceSession`] per lock, created by a [`SessionFactory`] from the
//! lock's [`DeviceIdentity`].

pub mod identity;
pub mod session;
pub mod simulator;

pub use identity::DeviceIdentity;
pub use session::{
    DeviceSession, LockAction, MechStatus, RawNotification, SessionError, SessionEvent,
    SessionFactory,
};
pub use simulator::{SimulatedLock, SimulatedSessionFactory};
