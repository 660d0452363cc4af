//! Station framework for the capture side of the engine.
//!
//! Each station runs in its own thread, connected by bounded crossbeam
//! channels. The uplink is built from these.

pub mod error;
pub mod station;

pub use error::{ErrorReporter, SessionReporter, StationError};
pub use station::{Station, StationRunner};
