//! Flow definition types.
//!
//! A flow is an ordered, immutable list of steps. Steps advance sequentially
//! by default; branching steps name their targets by step id, which are
//! resolved to indices once at load time. The reserved target `end` means the
//! execution terminates.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved branch target that terminates an execution.
pub const END_TARGET: &str = "end";

/// Longest `delay` or `wait_for_reply` timeout a flow may declare (one year).
pub const MAX_SUSPEND_SECS: u64 = 366 * 24 * 60 * 60;

/// Context variable holding the most recent inbound reply.
pub const LAST_RESPONSE_VAR: &str = "last_response";

/// Set while a `wait_for_reply` step is parked on the subject's answer.
pub const WAITING_FOR_RESPONSE_VAR: &str = "waiting_for_response";

/// Set when a reply resumed the execution.
pub const RESPONDED_VAR: &str = "responded";

/// Every message text of the reply batch, in arrival order.
pub const REPLY_BATCH_VAR: &str = "reply_batch";

/// Set when a `wait_for_reply` step resumed without a reply.
pub const TIMED_OUT_VAR: &str = "timed_out";

// ---------------------------------------------------------------------------
// Flow Definition
// ---------------------------------------------------------------------------

/// An immutable flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// UUIDv7 assigned on first import.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Unique human-readable flow name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic definition version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Ordered steps. Index 0 is the entry point.
    pub steps: Vec<StepDefinition>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_version() -> u32 {
    1
}

impl FlowDefinition {
    /// Index of the step with the given id.
    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Resolve a branch target (`end` or a step id) to a cursor.
    pub fn resolve_target(&self, target: &str) -> Option<StepCursor> {
        if target == END_TARGET {
            return Some(StepCursor::Terminal);
        }
        self.index_of(target).map(StepCursor::At)
    }

    /// The cursor following `index` in sequential order.
    pub fn next_after(&self, index: usize) -> StepCursor {
        if index + 1 < self.steps.len() {
            StepCursor::At(index + 1)
        } else {
            StepCursor::Terminal
        }
    }

    pub fn step(&self, cursor: StepCursor) -> Option<&StepDefinition> {
        match cursor {
            StepCursor::At(index) => self.steps.get(index),
            StepCursor::Terminal => None,
        }
    }
}

/// A stored flow together with bookkeeping timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub definition: FlowDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Step cursor
// ---------------------------------------------------------------------------

/// Position of an execution within its flow: a valid step index or the
/// terminal sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCursor {
    At(usize),
    Terminal,
}

impl StepCursor {
    pub fn index(self) -> Option<usize> {
        match self {
            StepCursor::At(index) => Some(index),
            StepCursor::Terminal => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepCursor::Terminal)
    }
}

impl fmt::Display for StepCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepCursor::At(index) => write!(f, "{index}"),
            StepCursor::Terminal => f.write_str(END_TARGET),
        }
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Author-defined step id. Unique within a flow, never `end`.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Step-specific configuration payload.
    pub config: StepConfig,
}

impl StepDefinition {
    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }

    /// Every branch target this step can jump to.
    pub fn targets(&self) -> Vec<&str> {
        match &self.config {
            StepConfig::WaitForReply {
                on_reply,
                on_timeout,
                ..
            } => on_reply
                .iter()
                .chain(on_timeout.iter())
                .map(String::as_str)
                .collect(),
            StepConfig::Branch {
                then_step,
                else_step,
                ..
            } => vec![then_step.as_str(), else_step.as_str()],
            StepConfig::Switch { cases, default, .. } => cases
                .iter()
                .map(|c| c.target.as_str())
                .chain(default.iter().map(String::as_str))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// The kind of step. Keys the step library registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    SendMessage,
    WaitForReply,
    Branch,
    Switch,
    Delay,
    CallTool,
    SetVariables,
}

impl StepType {
    pub const ALL: [StepType; 7] = [
        StepType::SendMessage,
        StepType::WaitForReply,
        StepType::Branch,
        StepType::Switch,
        StepType::Delay,
        StepType::CallTool,
        StepType::SetVariables,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepType::SendMessage => "send_message",
            StepType::WaitForReply => "wait_for_reply",
            StepType::Branch => "branch",
            StepType::Switch => "switch",
            StepType::Delay => "delay",
            StepType::CallTool => "call_tool",
            StepType::SetVariables => "set_variables",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown step type: '{s}'"))
    }
}

/// Step-specific configuration payload.
///
/// Internally tagged by `type`:
/// ```yaml
/// config:
///   type: send_message
///   text: "Hi {{ name }}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Send an outbound message to the subject.
    SendMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_url: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        buttons: Vec<String>,
    },
    /// Optionally prompt, then park until the subject replies or the timeout
    /// lapses.
    WaitForReply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_reply: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_timeout: Option<String>,
        /// Copy the reply text into this variable in addition to `last_response`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_as: Option<String>,
    },
    /// Jump to one of two targets depending on a condition.
    Branch {
        condition: Condition,
        #[serde(rename = "then")]
        then_step: String,
        #[serde(rename = "else")]
        else_step: String,
    },
    /// Jump to the target whose case matches a variable's value.
    Switch {
        #[serde(default = "default_variable")]
        variable: String,
        cases: Vec<SwitchCase>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// Park for a fixed duration.
    Delay { seconds: u64 },
    /// Invoke an external tool and optionally store its result.
    CallTool {
        tool: String,
        #[serde(default)]
        arguments: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_variable: Option<String>,
    },
    /// Write static values into the execution context.
    SetVariables {
        values: serde_json::Map<String, serde_json::Value>,
    },
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::SendMessage { .. } => StepType::SendMessage,
            StepConfig::WaitForReply { .. } => StepType::WaitForReply,
            StepConfig::Branch { .. } => StepType::Branch,
            StepConfig::Switch { .. } => StepType::Switch,
            StepConfig::Delay { .. } => StepType::Delay,
            StepConfig::CallTool { .. } => StepType::CallTool,
            StepConfig::SetVariables { .. } => StepType::SetVariables,
        }
    }
}

fn default_variable() -> String {
    LAST_RESPONSE_VAR.to_string()
}

/// One arm of a `switch` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: String,
    pub target: String,
}

/// Predicate over a context variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Case-insensitive substring match.
    Contains {
        #[serde(default = "default_variable")]
        variable: String,
        value: String,
    },
    /// Case-insensitive, whitespace-trimmed equality.
    Equals {
        #[serde(default = "default_variable")]
        variable: String,
        value: String,
    },
    /// Variable is present, not null, and not an empty string.
    Exists {
        #[serde(default = "default_variable")]
        variable: String,
    },
}
