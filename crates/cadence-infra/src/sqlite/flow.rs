//! SQLite flow repository implementation.
//!
//! Flow definitions are stored as JSON blobs keyed by id, with a unique name.

use cadence_core::repository::flow::FlowRepository;
use cadence_types::error::RepositoryError;
use cadence_types::flow::{FlowDefinition, FlowRecord};
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime};

/// SQLite-backed implementation of `FlowRepository`.
pub struct SqliteFlowRepository {
    pool: DatabasePool,
}

impl SqliteFlowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn fetch_one(
        &self,
        sql: &str,
        key: String,
    ) -> Result<Option<FlowDefinition>, RepositoryError> {
        let row = sqlx::query(sql)
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = FlowRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?.definition))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct FlowRow {
    definition: String,
    created_at: String,
    updated_at: String,
}

impl FlowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<FlowRecord, RepositoryError> {
        let definition = serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid flow definition JSON: {e}")))?;
        Ok(FlowRecord {
            definition,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// FlowRepository impl
// ---------------------------------------------------------------------------

impl FlowRepository for SqliteFlowRepository {
    async fn save_flow(&self, flow: &FlowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(flow)
            .map_err(|e| RepositoryError::Query(format!("serialize flow: {e}")))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO flows (id, name, definition, version, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 version = excluded.version,
                 updated_at = excluded.updated_at"#,
        )
        .bind(flow.id.to_string())
        .bind(&flow.name)
        .bind(&definition_json)
        .bind(i64::from(flow.version))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(
                format!("a flow named '{}' already exists", flow.name),
            ),
            _ => RepositoryError::Query(e.to_string()),
        })?;

        tracing::debug!(flow_id = %flow.id, name = %flow.name, "flow saved");
        Ok(())
    }

    async fn get_flow(&self, id: &Uuid) -> Result<Option<FlowDefinition>, RepositoryError> {
        self.fetch_one("SELECT * FROM flows WHERE id = ?", id.to_string())
            .await
    }

    async fn get_flow_version(&self, id: &Uuid) -> Result<Option<u32>, RepositoryError> {
        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM flows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        version
            .map(|v| {
                u32::try_from(v).map_err(|_| RepositoryError::Query(format!("invalid flow version {v}")))
            })
            .transpose()
    }

    async fn get_flow_by_name(&self, name: &str) -> Result<Option<FlowDefinition>, RepositoryError> {
        self.fetch_one("SELECT * FROM flows WHERE name = ?", name.to_string())
            .await
    }

    async fn list_flows(&self) -> Result<Vec<FlowRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM flows ORDER BY name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut flows = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = FlowRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            flows.push(r.into_record()?);
        }
        Ok(flows)
    }

    async fn delete_flow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM flows WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
