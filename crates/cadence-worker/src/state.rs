//! Application state wiring the engine together.
//!
//! AppState holds the concrete repositories and the step library used by both
//! the one-shot CLI commands and the long-running worker. Engine components
//! are generic over repository traits; AppState pins them to SQLite.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use cadence_core::flow::library::StepLibrary;
use cadence_core::flow::outbound::{ChannelClient, LogChannel, NoTools};
use cadence_core::schedule::settings::SubjectSettings;
use cadence_infra::config::{load_engine_config, resolve_database_url};
use cadence_infra::filesystem::{ensure_data_dir, resolve_config_path, resolve_data_dir};
use cadence_infra::http::{HttpChannel, HttpTools};
use cadence_infra::sqlite::execution::SqliteExecutionRepository;
use cadence_infra::sqlite::flow::SqliteFlowRepository;
use cadence_infra::sqlite::pool::{DatabasePool, with_create_mode};
use cadence_types::config::EngineConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    pub executions: Arc<SqliteExecutionRepository>,
    pub flows: Arc<SqliteFlowRepository>,
    pub library: Arc<StepLibrary>,
    pub settings: Arc<SubjectSettings>,
}

impl AppState {
    /// Connect to the database and build the step library.
    pub async fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        let db_url = resolve_database_url(&config);
        let db_pool = DatabasePool::connect(&with_create_mode(&db_url), &config.database)
            .await
            .with_context(|| format!("failed to open database {db_url}"))?;

        let library = build_library(&config);

        Ok(Self {
            executions: Arc::new(SqliteExecutionRepository::new(db_pool.clone())),
            flows: Arc::new(SqliteFlowRepository::new(db_pool)),
            library: Arc::new(library),
            settings: Arc::new(SubjectSettings::new(config.aggregation.clone())),
            config,
            data_dir,
        })
    }
}

/// Resolve and load the config file. The data directory is created first so
/// the default database location is writable.
pub async fn load_config(config_override: Option<PathBuf>) -> anyhow::Result<EngineConfig> {
    let data_dir = resolve_data_dir();
    ensure_data_dir(&data_dir)
        .await
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let config_path = config_override.unwrap_or_else(|| resolve_config_path(&data_dir));
    Ok(load_engine_config(&config_path).await)
}

/// HTTP clients when endpoints are configured, logging stand-ins otherwise.
fn build_library(config: &EngineConfig) -> StepLibrary {
    match &config.channel.outbound_url {
        Some(url) => with_tools(Arc::new(HttpChannel::new(url)), config),
        None => {
            tracing::info!("no channel endpoint configured, outbound messages will only be logged");
            with_tools(Arc::new(LogChannel), config)
        }
    }
}

fn with_tools<C: ChannelClient + 'static>(channel: Arc<C>, config: &EngineConfig) -> StepLibrary {
    match &config.tools.base_url {
        Some(url) => StepLibrary::builtin(channel, Arc::new(HttpTools::new(url))),
        None => StepLibrary::builtin(channel, Arc::new(NoTools)),
    }
}
