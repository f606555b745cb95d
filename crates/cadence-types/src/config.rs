//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml`. Every section and
//! field has a default, so an empty file (or no file) is a valid config.

use serde::{Deserialize, Serialize};

use crate::agent::AgentSettings;

/// Top-level configuration for the Cadence worker.
///
/// Loaded from `~/.cadence/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub interpreter: InterpreterConfig,
    /// Default agent settings applied to every subject.
    #[serde(default)]
    pub aggregation: AgentSettings,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL. Defaults to `cadence.db` inside the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Connections in the read-only pool.
    #[serde(default = "default_max_readers")]
    pub max_readers: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_readers() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_readers: default_max_readers(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// What the queue consumer does with a message whose step failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStepPolicy {
    /// Reject without requeue. The execution stays `FAILED`.
    #[default]
    Reject,
    /// Requeue until `max_redeliveries`, then reject.
    Requeue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of consumer tasks, each handling one message at a time.
    #[serde(default = "default_consumers")]
    pub consumers: usize,
    /// Bound of the in-process queue channel.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub failed_step_policy: FailedStepPolicy,
    /// Redelivery bound for requeued messages.
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

fn default_consumers() -> usize {
    4
}

fn default_capacity() -> usize {
    1024
}

fn default_max_redeliveries() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            consumers: default_consumers(),
            capacity: default_capacity(),
            failed_step_policy: FailedStepPolicy::default(),
            max_redeliveries: default_max_redeliveries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Steps run per `advance` before yielding with a continuation trigger.
    #[serde(default = "default_max_steps")]
    pub max_steps_per_advance: usize,
    /// How long `advance` waits for the per-execution lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// An active execution untouched this long counts as stuck.
    #[serde(default = "default_stuck_after_sec")]
    pub stuck_after_sec: u64,
}

fn default_max_steps() -> usize {
    32
}

fn default_lock_timeout_ms() -> u64 {
    2000
}

fn default_stuck_after_sec() -> u64 {
    900
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_steps_per_advance: default_max_steps(),
            lock_timeout_ms: default_lock_timeout_ms(),
            stuck_after_sec: default_stuck_after_sec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the sweep that wakes due delays and stalled executions.
    #[serde(default = "default_wake_interval")]
    pub wake_interval_sec: u64,
}

fn default_wake_interval() -> u64 {
    15
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wake_interval_sec: default_wake_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Endpoint receiving outbound messages. Unset means log-only delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Base URL tools are POSTed to as `{base_url}/tools/{tool}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Emit JSON log lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Bridge spans to the OpenTelemetry stdout exporter.
    #[serde(default)]
    pub otel: bool,
}
