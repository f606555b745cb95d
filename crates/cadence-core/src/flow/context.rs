//! Per-step execution context and template resolution.
//!
//! `StepContext` is the read-only view a step handler receives: the
//! execution's accumulated variables, where it sits in the flow, and why it is
//! running (fresh step or resume). Handlers never mutate it; they return a
//! context patch instead.

use std::sync::Arc;

use cadence_types::execution::ContextMap;
use cadence_types::flow::{Condition, FlowDefinition, StepCursor};
use cadence_types::message::TriggerKind;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::library::HandlerError;

/// Why a suspended step is running again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    Reply,
    IdleTimeout,
    DelayElapsed,
}

impl Resume {
    pub fn from_trigger(kind: TriggerKind) -> Option<Self> {
        match kind {
            TriggerKind::Reply => Some(Resume::Reply),
            TriggerKind::IdleTimeout => Some(Resume::IdleTimeout),
            TriggerKind::DelayElapsed => Some(Resume::DelayElapsed),
            TriggerKind::Step | TriggerKind::Manual => None,
        }
    }
}

/// Everything a step handler may read.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: Uuid,
    pub subject_id: String,
    pub step_index: usize,
    pub flow: Arc<FlowDefinition>,
    pub variables: ContextMap,
    /// `Some` when a suspended step is being resumed.
    pub resume: Option<Resume>,
    /// The stored resume time of a durable suspension, if any.
    pub resume_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl StepContext {
    /// Key tagging every outbound side effect of this step.
    ///
    /// Stable across redeliveries of the same trigger, so providers can drop
    /// duplicates.
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.execution_id, self.step_index)
    }

    /// Sequential successor of the current step.
    pub fn next(&self) -> StepCursor {
        self.flow.next_after(self.step_index)
    }

    /// Resolve a branch target named in the step config.
    pub fn target(&self, target: &str) -> Result<StepCursor, HandlerError> {
        self.flow
            .resolve_target(target)
            .ok_or_else(|| HandlerError::InvalidTarget(target.to_string()))
    }

    /// Look up a variable, following dots into nested objects
    /// (`order.total`).
    pub fn variable(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.variables.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Variable rendered as text, empty when absent or null.
    pub fn variable_text(&self, path: &str) -> String {
        match self.variable(path) {
            None | Some(Value::Null) => String::new(),
            Some(value) => value_to_string(value),
        }
    }

    /// Replace `{{ name }}` markers with variable values.
    ///
    /// Unknown references are left as-is (not an error).
    pub fn resolve_template(&self, template: &str) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start..].find("}}") else {
                break;
            };
            let end = start + len + 2;
            let path = rest[start + 2..end - 2].trim();

            result.push_str(&rest[..start]);
            match self.variable(path) {
                Some(value) if !path.is_empty() => result.push_str(&value_to_string(value)),
                _ => result.push_str(&rest[start..end]),
            }
            rest = &rest[end..];
        }

        result.push_str(rest);
        result
    }

    /// Resolve templates inside every string of a JSON value.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve_template(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Evaluate a branch condition against the current variables.
    pub fn evaluate(&self, condition: &Condition) -> bool {
        match condition {
            Condition::Contains { variable, value } => self
                .variable_text(variable)
                .to_lowercase()
                .contains(&value.to_lowercase()),
            Condition::Equals { variable, value } => {
                normalize(&self.variable_text(variable)) == normalize(value)
            }
            Condition::Exists { variable } => match self.variable(variable) {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.trim().is_empty(),
                Some(_) => true,
            },
        }
    }
}

/// Trimmed, lowercased comparison form.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Render a JSON value as template text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(vars: Value) -> StepContext {
        let flow: FlowDefinition = serde_json::from_value(json!({
            "name": "t",
            "steps": [
                { "id": "a", "config": { "type": "delay", "seconds": 1 } },
                { "id": "b", "config": { "type": "delay", "seconds": 1 } }
            ]
        }))
        .unwrap();
        StepContext {
            execution_id: Uuid::nil(),
            subject_id: "chat-1".to_string(),
            step_index: 0,
            flow: Arc::new(flow),
            variables: vars.as_object().cloned().unwrap_or_default(),
            resume: None,
            resume_at: None,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_idempotency_key_format() {
        let c = ctx(json!({}));
        assert_eq!(
            c.idempotency_key(),
            "00000000-0000-0000-0000-000000000000-0"
        );
    }

    #[test]
    fn test_resolve_template() {
        let c = ctx(json!({ "name": "Ana", "order": { "total": 42 } }));
        assert_eq!(
            c.resolve_template("Hi {{ name }}, total {{order.total}}."),
            "Hi Ana, total 42."
        );
    }

    #[test]
    fn test_unknown_template_left_as_is() {
        let c = ctx(json!({}));
        assert_eq!(c.resolve_template("Hi {{ who }}"), "Hi {{ who }}");
        assert_eq!(c.resolve_template("open {{ brace"), "open {{ brace");
    }

    #[test]
    fn test_resolve_value_nested() {
        let c = ctx(json!({ "id": "c-9" }));
        let resolved = c.resolve_value(&json!({ "contact": "{{ id }}", "tags": ["{{ id }}", 1] }));
        assert_eq!(resolved, json!({ "contact": "c-9", "tags": ["c-9", 1] }));
    }

    #[test]
    fn test_conditions() {
        let c = ctx(json!({ "last_response": "  YES please ", "empty": "" }));
        assert!(c.evaluate(&Condition::Contains {
            variable: "last_response".into(),
            value: "yes".into()
        }));
        assert!(!c.evaluate(&Condition::Equals {
            variable: "last_response".into(),
            value: "yes".into()
        }));
        assert!(c.evaluate(&Condition::Equals {
            variable: "last_response".into(),
            value: "yes please".into()
        }));
        assert!(!c.evaluate(&Condition::Exists {
            variable: "empty".into()
        }));
        assert!(!c.evaluate(&Condition::Exists {
            variable: "missing".into()
        }));
    }

    #[test]
    fn test_target_resolution() {
        let c = ctx(json!({}));
        assert_eq!(c.next(), StepCursor::At(1));
        assert_eq!(c.target("end").unwrap(), StepCursor::Terminal);
        assert!(matches!(
            c.target("zzz"),
            Err(HandlerError::InvalidTarget(_))
        ));
    }
}
