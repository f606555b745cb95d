//! Decoding of queue message bodies.

use cadence_types::message::{ExecutionTrigger, InboundEvent};
use thiserror::Error;

/// The message body is unusable and retrying it can never succeed.
#[derive(Debug, Error)]
#[error("malformed message: {0}")]
pub struct MalformedMessage(pub String);

/// Decode an execution trigger; requires a valid `execution_id`.
pub fn decode_trigger(body: &[u8]) -> Result<ExecutionTrigger, MalformedMessage> {
    serde_json::from_slice(body).map_err(|e| MalformedMessage(e.to_string()))
}

/// Decode an inbound subject message; requires a non-empty `subject_id`.
pub fn decode_inbound(body: &[u8]) -> Result<InboundEvent, MalformedMessage> {
    let event: InboundEvent =
        serde_json::from_slice(body).map_err(|e| MalformedMessage(e.to_string()))?;
    if event.subject_id.trim().is_empty() {
        return Err(MalformedMessage("empty subject_id".to_string()));
    }
    Ok(event)
}
