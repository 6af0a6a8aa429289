//! Tracing and telemetry initialization for Tako.

pub mod tracing_setup;
