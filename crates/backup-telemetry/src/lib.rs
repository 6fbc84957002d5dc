//! This crate contains the tracing primitives used by the backup operator to emit logs to the
//! console, to rolling log files and traces to an OpenTelemetry collector.
pub mod tracing;

pub use tracing::{TelemetryOptions, Tracing};
