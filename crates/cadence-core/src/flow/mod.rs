//! Flow definitions, the step library and the interpreter that drives
//! executions through them.

pub mod context;
pub mod definition;
pub mod handlers;
pub mod interpreter;
pub mod launcher;
pub mod library;
pub mod lock;
pub mod outbound;
