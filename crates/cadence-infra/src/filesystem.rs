//! Data directory layout.
//!
//! Everything the worker persists lives under one directory: the SQLite
//! database and, by default, `config.toml`.

use std::path::{Path, PathBuf};

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `CADENCE_DATA_DIR` environment variable
/// 2. `~/.cadence`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CADENCE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".cadence");
    }

    // Last resort: current directory
    PathBuf::from(".cadence")
}

/// Path of the config file: `CADENCE_CONFIG` if set, else
/// `{data_dir}/config.toml`.
pub fn resolve_config_path(data_dir: &Path) -> PathBuf {
    match std::env::var("CADENCE_CONFIG") {
        Ok(path) => PathBuf::from(path),
        Err(_) => data_dir.join("config.toml"),
    }
}

/// Create the data directory if it does not exist yet.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(data_dir).await
}
