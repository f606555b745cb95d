//! Shared domain types for Cadence.
//!
//! This crate contains the domain types used across the flow engine: flow
//! definitions, executions, queue wire messages, agent settings, config, and
//! their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod config;
pub mod error;
pub mod execution;
pub mod flow;
pub mod message;
