//! Outbound collaborators invoked by step handlers.
//!
//! Channel providers (WhatsApp, SMS, ...) and external tools are opaque to the
//! engine. The only contract is the idempotency key carried on every call,
//! derived from `execution_id` and step index, so that a redelivered trigger
//! never produces a second visible action.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised by outbound collaborators.
#[derive(Debug, Error)]
pub enum OutboundError {
    /// The provider refused the request (4xx, invalid recipient, ...).
    #[error("rejected by provider: {0}")]
    Rejected(String),

    /// The request did not reach the provider or the response was unusable.
    #[error("transport error: {0}")]
    Transport(String),
}

/// A message for a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub subject_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<String>,
    pub idempotency_key: String,
}

/// A tool invocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub subject_id: String,
    pub arguments: Value,
    pub idempotency_key: String,
}

/// Delivers messages to subjects.
pub trait ChannelClient: Send + Sync {
    fn send(
        &self,
        message: &OutboundMessage,
    ) -> impl std::future::Future<Output = Result<(), OutboundError>> + Send;
}

/// Invokes named external tools.
pub trait ToolInvoker: Send + Sync {
    fn invoke(
        &self,
        call: &ToolCall,
    ) -> impl std::future::Future<Output = Result<Value, OutboundError>> + Send;
}

// ---------------------------------------------------------------------------
// Log-only collaborators
// ---------------------------------------------------------------------------

/// Channel that only logs, used when no provider endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct LogChannel;

impl ChannelClient for LogChannel {
    async fn send(&self, message: &OutboundMessage) -> Result<(), OutboundError> {
        tracing::info!(
            subject_id = %message.subject_id,
            idempotency_key = %message.idempotency_key,
            text = %message.text,
            "outbound message (log-only channel)"
        );
        Ok(())
    }
}

/// Tool invoker with no tools; every call is rejected.
#[derive(Debug, Clone, Default)]
pub struct NoTools;

impl ToolInvoker for NoTools {
    async fn invoke(&self, call: &ToolCall) -> Result<Value, OutboundError> {
        Err(OutboundError::Rejected(format!(
            "no tool endpoint configured for '{}'",
            call.tool
        )))
    }
}

// ---------------------------------------------------------------------------
// Test fakes
// ---------------------------------------------------------------------------
