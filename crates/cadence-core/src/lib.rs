//! Flow execution engine for Cadence.
//!
//! This crate defines the "ports" (repository, queue, channel and tool
//! traits) that the infrastructure layer implements, plus the engine built on
//! them: the step library and interpreter, the aggregation and idle-trigger
//! schedulers, and the queue consumers. It depends only on `cadence-types`,
//! never on `cadence-infra` or any database/IO crate.

pub mod flow;
pub mod queue;
pub mod repository;
pub mod schedule;
