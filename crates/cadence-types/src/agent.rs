//! Per-agent reaction settings consumed by the aggregation scheduler and the
//! idle-trigger timer. Owned by the agent configuration subsystem; read-only
//! to the engine.

use serde::{Deserialize, Serialize};

/// Smallest allowed aggregation window.
pub const MIN_WINDOW_SEC: u64 = 1;

/// How an agent reacts to bursts of inbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Coalesce bursts into batches. When false, every event is released alone.
    #[serde(default = "default_aggregation_enabled")]
    pub aggregation_enabled: bool,
    #[serde(default = "default_window_sec")]
    pub aggregation_window_sec: u64,
    /// A window reaching this many events is released immediately.
    #[serde(default = "default_max_batch")]
    pub max_batch_messages: usize,
    /// Fire an idle continuation after this much silence. `None` disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_if_idle_sec: Option<u64>,
}

fn default_aggregation_enabled() -> bool {
    true
}

fn default_window_sec() -> u64 {
    20
}

fn default_max_batch() -> usize {
    10
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            aggregation_enabled: default_aggregation_enabled(),
            aggregation_window_sec: default_window_sec(),
            max_batch_messages: default_max_batch(),
            reply_if_idle_sec: None,
        }
    }
}

impl AgentSettings {
    /// Settings with the window and batch cap clamped to usable minimums.
    pub fn clamped(&self) -> Self {
        Self {
            aggregation_enabled: self.aggregation_enabled,
            aggregation_window_sec: self.aggregation_window_sec.max(MIN_WINDOW_SEC),
            max_batch_messages: self.max_batch_messages.max(1),
            reply_if_idle_sec: self.reply_if_idle_sec.filter(|s| *s > 0),
        }
    }
}
