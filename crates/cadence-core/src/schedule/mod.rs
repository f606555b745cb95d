//! Timers that decide when work is handed to the interpreter.

pub mod aggregation;
pub mod delay_queue;
pub mod idle;
pub mod settings;
pub mod wake;
