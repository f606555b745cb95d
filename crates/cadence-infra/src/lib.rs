//! Infrastructure layer for Cadence.
//!
//! Contains implementations of the ports defined in `cadence-core`: SQLite
//! execution and flow storage, HTTP channel and tool clients, the TOML config
//! loader, and data directory resolution.

pub mod config;
pub mod filesystem;
pub mod http;
pub mod sqlite;
