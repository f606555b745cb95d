//! Queue transport port, the in-memory broker, and the consumers that settle
//! deliveries.

pub mod consumer;
pub mod inbound;
pub mod memory;
pub mod message;
pub mod transport;
