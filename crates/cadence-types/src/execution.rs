//! Flow execution state and execution log types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::{StepCursor, StepType};

/// Accumulated context variables of an execution. Last write wins.
pub type ContextMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Lifecycle status of a flow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    WaitingForEvent,
    Completed,
    Failed,
    /// Superseded by a newer execution of the same flow for the same subject.
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::WaitingForEvent => "WAITING_FOR_EVENT",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "WAITING_FOR_EVENT" => Ok(ExecutionStatus::WaitingForEvent),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Flow execution
// ---------------------------------------------------------------------------

/// One live instantiation of a flow, advancing on behalf of one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub flow_id: Uuid,
    /// Conversation or contact this execution acts for.
    pub subject_id: String,
    pub current_step: StepCursor,
    pub context: ContextMap,
    pub status: ExecutionStatus,
    /// When a durable suspension (delay or reply timeout) is due to resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// How this execution was started (e.g. "manual", "keyword").
    pub trigger_type: String,
    /// Optimistic concurrency version, bumped on every persisted write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowExecution {
    /// A fresh execution positioned at the first step.
    pub fn new(
        flow_id: Uuid,
        subject_id: impl Into<String>,
        trigger_type: impl Into<String>,
        context: ContextMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            flow_id,
            subject_id: subject_id.into(),
            current_step: StepCursor::At(0),
            context,
            status: ExecutionStatus::Running,
            resume_at: None,
            last_error: None,
            trigger_type: trigger_type.into(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Shallow-merge `patch` into the context (last write wins).
    pub fn apply_patch(&mut self, patch: ContextMap) {
        for (key, value) in patch {
            self.context.insert(key, value);
        }
    }
}

// ---------------------------------------------------------------------------
// Execution log
// ---------------------------------------------------------------------------

/// What happened when a step was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepLogOutcome {
    Advanced,
    Branched,
    Suspended,
    Completed,
    Failed,
}

impl StepLogOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StepLogOutcome::Advanced => "advanced",
            StepLogOutcome::Branched => "branched",
            StepLogOutcome::Suspended => "suspended",
            StepLogOutcome::Completed => "completed",
            StepLogOutcome::Failed => "failed",
        }
    }
}

impl std::str::FromStr for StepLogOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "advanced" => Ok(StepLogOutcome::Advanced),
            "branched" => Ok(StepLogOutcome::Branched),
            "suspended" => Ok(StepLogOutcome::Suspended),
            "completed" => Ok(StepLogOutcome::Completed),
            "failed" => Ok(StepLogOutcome::Failed),
            other => Err(format!("unknown step outcome: '{other}'")),
        }
    }
}

/// Audit record for a single step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_index: usize,
    pub step_id: String,
    pub step_type: StepType,
    pub outcome: StepLogOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&ExecutionStatus::WaitingForEvent).unwrap();
        assert_eq!(json, "\"WAITING_FOR_EVENT\"");
        assert_eq!(
            "WAITING_FOR_EVENT".parse::<ExecutionStatus>().unwrap(),
            ExecutionStatus::WaitingForEvent
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(ExecutionStatus::Running.is_active());
        assert!(ExecutionStatus::WaitingForEvent.is_active());
    }

    #[test]
    fn test_new_execution_starts_at_first_step() {
        let exec = FlowExecution::new(Uuid::now_v7(), "chat-1", "manual", ContextMap::new());
        assert_eq!(exec.current_step, StepCursor::At(0));
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.version, 0);
    }

    #[test]
    fn test_apply_patch_last_write_wins() {
        let mut exec = FlowExecution::new(Uuid::now_v7(), "chat-1", "manual", ContextMap::new());
        exec.context.insert("a".into(), serde_json::json!(1));
        let mut patch = ContextMap::new();
        patch.insert("a".into(), serde_json::json!(2));
        patch.insert("b".into(), serde_json::json!("x"));
        exec.apply_patch(patch);
        assert_eq!(exec.context["a"], serde_json::json!(2));
        assert_eq!(exec.context["b"], serde_json::json!("x"));
    }
}
