//! # mediarelay core
//!
//! The relay engine: moves a live stream from one endpoint to another,
//! re-creating endpoints when connections drop and accounting for every
//! byte received, written or lost.
//!
//! This crate provides:
//! - Relay configuration and the fatal error taxonomy
//! - Per-role connection tracking and the watchdog
//! - The single-threaded drain/forward loop
//! - Loss, bandwidth and stats reporting

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod relay;
pub mod state;
pub mod stats;
pub mod watchdog;

pub use cancel::CancellationToken;
pub use config::{RelayConfig, TimeoutMode};
pub use error::{RelayError, RelayResult};
pub use relay::{CycleReport, Relay, StepOutcome, StopReason};
pub use state::{ConnectionTracker, Transition};
pub use stats::{ByteCounters, StatsFormat, StatsSnapshot, StatsWriter};
pub use watchdog::Watchdog;
