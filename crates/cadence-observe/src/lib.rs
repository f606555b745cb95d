//! Logging and trace export for the Cadence flow engine.

pub mod tracing_setup;
