//! Testing utilities and mock implementations
//!
//! Mock bus and device sessions for exercising bridges without a broker or
//! real locks.

pub mod mocks;

pub use mocks::*;
