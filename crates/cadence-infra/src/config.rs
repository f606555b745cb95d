//! Engine configuration loader.
//!
//! Reads a TOML file (`{data_dir}/config.toml` unless `CADENCE_CONFIG` points
//! elsewhere) into [`EngineConfig`]. Falls back to defaults when the file is
//! missing or malformed, then applies environment overrides and clamps the
//! aggregation settings.

use std::path::Path;

use cadence_types::config::EngineConfig;

use crate::sqlite::pool::default_database_url;

/// Load the engine configuration from `config_path`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Environment overrides apply in every case.
pub async fn load_engine_config(config_path: &Path) -> EngineConfig {
    let config = match tokio::fs::read_to_string(config_path).await {
        Ok(content) => parse_or_default(&content, config_path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", config_path.display());
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    };
    finalize(config, |key| std::env::var(key).ok())
}

fn parse_or_default(content: &str, config_path: &Path) -> EngineConfig {
    match toml::from_str::<EngineConfig>(content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Apply environment overrides (looked up through `env`) and clamp settings.
pub fn finalize(mut config: EngineConfig, env: impl Fn(&str) -> Option<String>) -> EngineConfig {
    if let Some(url) = env("CADENCE_DATABASE_URL") {
        config.database.url = Some(url);
    }
    config.aggregation = config.aggregation.clamped();
    config.queue.consumers = config.queue.consumers.max(1);
    config.interpreter.max_steps_per_advance = config.interpreter.max_steps_per_advance.max(1);
    config.scheduler.wake_interval_sec = config.scheduler.wake_interval_sec.max(1);
    config
}

/// The database URL to connect to: configured, or the data-dir default.
pub fn resolve_database_url(config: &EngineConfig) -> String {
    config
        .database
        .url
        .clone()
        .unwrap_or_else(default_database_url)
}
