//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (cadence-infra) implements. The core crate never depends on any
//! specific storage technology. `memory` provides an in-process
//! implementation used by tests and single-process deployments.

pub mod execution;
pub mod flow;
pub mod memory;
