//! SQLite connection pools for the execution store.
//!
//! Reads go through a read-only pool; every write goes through a pool with
//! exactly one connection. Because writes never interleave, the
//! `UPDATE ... WHERE version = ?` in the execution repository and the
//! follow-up lookup that tells a stale version from a missing row see the
//! same database state.

use std::str::FromStr;
use std::time::Duration;

use cadence_types::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::filesystem::resolve_data_dir;

#[derive(Clone)]
pub struct DatabasePool {
    /// Read-only, up to `max_readers` connections.
    pub reader: SqlitePool,
    /// Single connection; all INSERT/UPDATE/DELETE statements.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open with default pool settings.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::connect(database_url, &DatabaseConfig::default()).await
    }

    /// Open `database_url`, apply the embedded migrations on the writer, then
    /// open the reader pool.
    pub async fn connect(database_url: &str, config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(config.max_readers.max(1))
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(
            url = database_url,
            max_readers = config.max_readers,
            "execution store opened"
        );
        Ok(Self { reader, writer })
    }

    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }
}

/// `{data_dir}/cadence.db` as a SQLite URL.
pub fn default_database_url() -> String {
    format!("sqlite://{}/cadence.db", resolve_data_dir().display())
}

/// Add `mode=rwc` to a plain SQLite file URL so a fresh install creates the
/// database file. URLs that already carry options are left alone.
pub fn with_create_mode(url: &str) -> String {
    if url.starts_with("sqlite://") && !url.contains('?') && !url.contains(":memory:") {
        format!("{url}?mode=rwc")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::execution::SqliteExecutionRepository;
    use cadence_core::repository::execution::ExecutionRepository;
    use cadence_types::error::RepositoryError;
    use cadence_types::execution::{ContextMap, ExecutionStatus, FlowExecution};
    use uuid::Uuid;

    fn temp_url(dir: &tempfile::TempDir) -> String {
        with_create_mode(&format!("sqlite://{}", dir.path().join("store.db").display()))
    }

    #[tokio::test]
    async fn test_schema_is_migrated_once() {
        let dir = tempfile::tempdir().unwrap();
        let url = temp_url(&dir);

        let first = DatabasePool::new(&url).await.unwrap();
        first.close().await;
        let pool = DatabasePool::new(&url).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(names, vec!["flow_execution_logs", "flow_executions", "flows"]);

        let (applied,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(&pool.reader)
            .await
            .unwrap();
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn test_reader_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&temp_url(&dir)).await.unwrap();

        let result = sqlx::query("DELETE FROM flows").execute(&pool.reader).await;
        assert!(result.is_err());
        sqlx::query("DELETE FROM flows")
            .execute(&pool.writer)
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_writer_lets_one_versioned_update_win() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&temp_url(&dir)).await.unwrap();
        let repo = std::sync::Arc::new(SqliteExecutionRepository::new(pool));

        let exec = FlowExecution::new(Uuid::now_v7(), "chat-1", "manual", ContextMap::new());
        repo.create_execution(&exec).await.unwrap();

        let writers = (0..8).map(|_| {
            let repo = repo.clone();
            let mut exec = exec.clone();
            exec.status = ExecutionStatus::WaitingForEvent;
            tokio::spawn(async move { repo.update_execution(&exec).await })
        });
        let mut won = 0;
        let mut conflicts = 0;
        for writer in writers {
            match writer.await.unwrap() {
                Ok(version) => {
                    assert_eq!(version, 1);
                    won += 1;
                }
                Err(RepositoryError::Conflict(_)) => conflicts += 1,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(repo.get_execution(&exec.id).await.unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_create_mode_added_once() {
        assert_eq!(with_create_mode("sqlite:///tmp/a.db"), "sqlite:///tmp/a.db?mode=rwc");
        assert_eq!(
            with_create_mode("sqlite:///tmp/a.db?mode=ro"),
            "sqlite:///tmp/a.db?mode=ro"
        );
        assert_eq!(with_create_mode("sqlite::memory:"), "sqlite::memory:");
    }

    #[test]
    fn test_default_database_url_in_data_dir() {
        let url = default_database_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with("/cadence.db"));
    }
}
