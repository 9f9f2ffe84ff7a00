//! Bridge coordinator
//!
//! One [`DeviceBridge`] task per configured lock runs the connection
//! lifecycle, dispatches commands and forwards state snapshots. The
//! [`BridgeSupervisor`] owns the bridges and routes bus messages to them.
//!
//! # Architecture
//!
//! - [`state`] - connection states and the legal transitions between them
//! - [`machine`] - pure per-device state machine producing effects
//! - [`backoff`] - capped exponential reconnect delays with jitter
//! - [`pending`] - single-slot latest-wins command buffer
//! - [`translator`] - notification to snapshot to bus payload
//! - [`device_bridge`] - async runner executing machine effects
//! - [`supervisor`] - bridge set, routing and shutdown

pub mod backoff;
pub mod device_bridge;
pub mod machine;
pub mod pending;
pub mod state;
pub mod supervisor;
pub mod translator;

pub use backoff::{Backoff, BackoffPolicy};
pub use device_bridge::{BridgeHandle, BridgeSettings, DeviceBridge, StateOutlet};
pub use machine::{BridgeCore, BridgeEffect, BridgeInput, PendingOperation};
pub use pending::PendingSlot;
pub use state::ConnectionState;
pub use supervisor::{
    BridgeSupervisor, CommandRouter, RouteOutcome, ShutdownReport, SupervisorSettings,
};
pub use translator::{DeviceStateSnapshot, StateTranslator};
