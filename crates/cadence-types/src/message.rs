//! Queue wire types: execution triggers and inbound subject messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::ContextMap;

/// Queue carrying execution triggers (`{ "execution_id": ... }`).
pub const FLOW_EXECUTION_TOPIC: &str = "flow.execution";

/// Queue carrying raw inbound subject messages.
pub const INBOUND_TOPIC: &str = "inbound.message";

/// Queue carrying batches for the AI agent when no flow waits for them.
pub const AGENT_REPLY_TOPIC: &str = "agent.reply";

// ---------------------------------------------------------------------------
// Execution trigger
// ---------------------------------------------------------------------------

/// Why an execution is being advanced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Continue a running execution.
    #[default]
    Step,
    /// The subject replied while the execution waited.
    Reply,
    /// The subject stayed idle past `reply_if_idle_sec` or the reply timeout.
    IdleTimeout,
    /// A `delay` step's resume time has passed.
    DelayElapsed,
    /// Operator-initiated continuation.
    Manual,
}

impl TriggerKind {
    /// Whether this trigger resumes a suspended execution rather than
    /// continuing a running one.
    pub fn is_resume(self) -> bool {
        matches!(
            self,
            TriggerKind::Reply | TriggerKind::IdleTimeout | TriggerKind::DelayElapsed
        )
    }
}

/// One queue message asking the engine to advance an execution.
///
/// Only `execution_id` is required. Unknown fields are kept in `payload` and
/// merged into the execution context before the step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrigger {
    pub execution_id: Uuid,
    #[serde(default)]
    pub kind: TriggerKind,
    /// Step the publisher observed. A mismatch with the stored cursor marks
    /// the trigger as stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(flatten)]
    pub payload: ContextMap,
}

impl ExecutionTrigger {
    pub fn new(execution_id: Uuid, kind: TriggerKind) -> Self {
        Self {
            execution_id,
            kind,
            step_index: None,
            payload: ContextMap::new(),
        }
    }

    /// Plain continuation of a running execution.
    pub fn step(execution_id: Uuid) -> Self {
        Self::new(execution_id, TriggerKind::Step)
    }

    pub fn at_step(mut self, step_index: usize) -> Self {
        self.step_index = Some(step_index);
        self
    }

    pub fn with_payload(mut self, payload: ContextMap) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// Inbound message
// ---------------------------------------------------------------------------

/// A message received from a subject on some channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub subject_id: String,
    #[serde(default)]
    pub text: String,
    /// Raw provider payload, forwarded untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn text(subject_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            subject_id: subject_id.into(),
            text: text.into(),
            payload: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent reply request
// ---------------------------------------------------------------------------

/// A released batch handed to the AI agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReplyRequest {
    pub subject_id: String,
    /// Batch texts joined by newline.
    pub text: String,
    pub messages: Vec<InboundEvent>,
}

impl AgentReplyRequest {
    pub fn from_batch(subject_id: impl Into<String>, messages: Vec<InboundEvent>) -> Self {
        let text = messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            subject_id: subject_id.into(),
            text,
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_minimal_body() {
        let id = Uuid::now_v7();
        let trigger: ExecutionTrigger =
            serde_json::from_str(&format!(r#"{{"execution_id":"{id}"}}"#)).unwrap();
        assert_eq!(trigger.execution_id, id);
        assert_eq!(trigger.kind, TriggerKind::Step);
        assert_eq!(trigger.step_index, None);
        assert!(trigger.payload.is_empty());
    }

    #[test]
    fn test_trigger_extra_fields_land_in_payload() {
        let id = Uuid::now_v7();
        let body = serde_json::json!({
            "execution_id": id,
            "kind": "reply",
            "step_index": 1,
            "last_response": "yes",
        });
        let trigger: ExecutionTrigger = serde_json::from_value(body).unwrap();
        assert_eq!(trigger.kind, TriggerKind::Reply);
        assert_eq!(trigger.step_index, Some(1));
        assert_eq!(trigger.payload["last_response"], "yes");
        assert!(!trigger.payload.contains_key("execution_id"));
    }

    #[test]
    fn test_trigger_serializes_flat() {
        let id = Uuid::now_v7();
        let mut payload = ContextMap::new();
        payload.insert("source".into(), serde_json::json!("idle"));
        let trigger = ExecutionTrigger::new(id, TriggerKind::IdleTimeout)
            .at_step(2)
            .with_payload(payload);
        let value = serde_json::to_value(&trigger).unwrap();
        assert_eq!(value["execution_id"], serde_json::json!(id));
        assert_eq!(value["kind"], "idle_timeout");
        assert_eq!(value["source"], "idle");
    }

    #[test]
    fn test_trigger_missing_id_rejected() {
        assert!(serde_json::from_str::<ExecutionTrigger>("{}").is_err());
        assert!(serde_json::from_str::<ExecutionTrigger>(r#"{"execution_id":"nope"}"#).is_err());
    }

    #[test]
    fn test_inbound_defaults() {
        let event: InboundEvent =
            serde_json::from_str(r#"{"subject_id":"chat-9","text":"hi"}"#).unwrap();
        assert_eq!(event.subject_id, "chat-9");
        assert!(event.payload.is_null());
    }

    #[test]
    fn test_agent_reply_joins_texts() {
        let request = AgentReplyRequest::from_batch(
            "s1",
            vec![InboundEvent::text("s1", "hi"), InboundEvent::text("s1", "there")],
        );
        assert_eq!(request.text, "hi\nthere");
        assert_eq!(request.messages.len(), 2);
    }
}
