//! SQLite execution store implementation.
//!
//! Implements `ExecutionRepository` from `cadence-core` using sqlx with split
//! read/write pools. The context map is stored as a JSON blob; the cursor is a
//! nullable integer where NULL means "past the last step". Updates are
//! compare-and-set on the `version` column.

use cadence_core::repository::execution::ExecutionRepository;
use cadence_types::error::RepositoryError;
use cadence_types::execution::{
    ContextMap, ExecutionLogEntry, ExecutionStatus, FlowExecution, StepLogOutcome,
};
use cadence_types::flow::{StepCursor, StepType};
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid};

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn fetch_executions<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<Vec<FlowExecution>, RepositoryError> {
        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    flow_id: String,
    subject_id: String,
    current_step: Option<i64>,
    context: String,
    status: String,
    resume_at: Option<String>,
    last_error: Option<String>,
    trigger_type: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            flow_id: row.try_get("flow_id")?,
            subject_id: row.try_get("subject_id")?,
            current_step: row.try_get("current_step")?,
            context: row.try_get("context")?,
            status: row.try_get("status")?,
            resume_at: row.try_get("resume_at")?,
            last_error: row.try_get("last_error")?,
            trigger_type: row.try_get("trigger_type")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_execution(self) -> Result<FlowExecution, RepositoryError> {
        let status: ExecutionStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;

        let context: ContextMap = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?;

        let current_step = match self.current_step {
            Some(index) if index >= 0 => StepCursor::At(index as usize),
            Some(index) => {
                return Err(RepositoryError::Query(format!(
                    "invalid step index: {index}"
                )));
            }
            None => StepCursor::Terminal,
        };

        Ok(FlowExecution {
            id: parse_uuid(&self.id)?,
            flow_id: parse_uuid(&self.flow_id)?,
            subject_id: self.subject_id,
            current_step,
            context,
            status,
            resume_at: self.resume_at.as_deref().map(parse_datetime).transpose()?,
            last_error: self.last_error,
            trigger_type: self.trigger_type,
            version: self.version,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct LogRow {
    id: String,
    execution_id: String,
    step_index: i64,
    step_id: String,
    step_type: String,
    outcome: String,
    message: Option<String>,
    created_at: String,
}

impl LogRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step_index: row.try_get("step_index")?,
            step_id: row.try_get("step_id")?,
            step_type: row.try_get("step_type")?,
            outcome: row.try_get("outcome")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_entry(self) -> Result<ExecutionLogEntry, RepositoryError> {
        let step_type: StepType = self
            .step_type
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let outcome: StepLogOutcome = self
            .outcome
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;

        Ok(ExecutionLogEntry {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_index: self.step_index.max(0) as usize,
            step_id: self.step_id,
            step_type,
            outcome,
            message: self.message,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn cursor_column(cursor: StepCursor) -> Option<i64> {
    cursor.index().map(|i| i as i64)
}

fn context_json(context: &ContextMap) -> Result<String, RepositoryError> {
    serde_json::to_string(context).map_err(|e| RepositoryError::Query(e.to_string()))
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn create_execution(&self, execution: &FlowExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO flow_executions
               (id, flow_id, subject_id, current_step, context, status, resume_at,
                last_error, trigger_type, version, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.flow_id.to_string())
        .bind(&execution.subject_id)
        .bind(cursor_column(execution.current_step))
        .bind(context_json(&execution.context)?)
        .bind(execution.status.as_str())
        .bind(execution.resume_at.as_ref().map(format_datetime))
        .bind(&execution.last_error)
        .bind(&execution.trigger_type)
        .bind(execution.version)
        .bind(format_datetime(&execution.created_at))
        .bind(format_datetime(&execution.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("execution {} already exists", execution.id))
            }
            _ => RepositoryError::Query(e.to_string()),
        })?;

        tracing::debug!(execution_id = %execution.id, subject_id = %execution.subject_id, "execution created");
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<FlowExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM flow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn update_execution(&self, execution: &FlowExecution) -> Result<i64, RepositoryError> {
        let next_version = execution.version + 1;
        let result = sqlx::query(
            r#"UPDATE flow_executions SET
                 current_step = ?, context = ?, status = ?, resume_at = ?,
                 last_error = ?, version = ?, updated_at = ?
               WHERE id = ? AND version = ?"#,
        )
        .bind(cursor_column(execution.current_step))
        .bind(context_json(&execution.context)?)
        .bind(execution.status.as_str())
        .bind(execution.resume_at.as_ref().map(format_datetime))
        .bind(&execution.last_error)
        .bind(next_version)
        .bind(format_datetime(&execution.updated_at))
        .bind(execution.id.to_string())
        .bind(execution.version)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(next_version);
        }

        // Distinguish a stale version from a missing row.
        let stored: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM flow_executions WHERE id = ?")
                .bind(execution.id.to_string())
                .fetch_optional(&self.pool.writer)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match stored {
            Some((version,)) => Err(RepositoryError::Conflict(format!(
                "execution {} version {} is stale (stored {version})",
                execution.id, execution.version
            ))),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn find_active_execution(
        &self,
        flow_id: &Uuid,
        subject_id: &str,
    ) -> Result<Option<FlowExecution>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT * FROM flow_executions
               WHERE flow_id = ? AND subject_id = ? AND status IN ('RUNNING', 'WAITING_FOR_EVENT')
               ORDER BY updated_at DESC, id DESC LIMIT 1"#,
        )
        .bind(flow_id.to_string())
        .bind(subject_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_subject_executions(
        &self,
        subject_id: &str,
        status: ExecutionStatus,
    ) -> Result<Vec<FlowExecution>, RepositoryError> {
        self.fetch_executions(
            sqlx::query(
                "SELECT * FROM flow_executions WHERE subject_id = ? AND status = ? ORDER BY updated_at ASC, id ASC",
            )
            .bind(subject_id)
            .bind(status.as_str()),
        )
        .await
    }

    async fn list_executions_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<FlowExecution>, RepositoryError> {
        self.fetch_executions(
            sqlx::query(
                "SELECT * FROM flow_executions WHERE status = ? ORDER BY updated_at ASC, id ASC",
            )
            .bind(status.as_str()),
        )
        .await
    }

    async fn list_due_executions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FlowExecution>, RepositoryError> {
        self.fetch_executions(
            sqlx::query(
                r#"SELECT * FROM flow_executions
                   WHERE status = 'WAITING_FOR_EVENT' AND resume_at IS NOT NULL AND resume_at <= ?
                   ORDER BY resume_at ASC, id ASC"#,
            )
            .bind(format_datetime(&now)),
        )
        .await
    }

    async fn list_stalled_executions(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<FlowExecution>, RepositoryError> {
        self.fetch_executions(
            sqlx::query(
                "SELECT * FROM flow_executions WHERE status = 'RUNNING' AND updated_at < ? ORDER BY updated_at ASC, id ASC",
            )
            .bind(format_datetime(&before)),
        )
        .await
    }

    async fn list_recent_executions(
        &self,
        limit: u32,
    ) -> Result<Vec<FlowExecution>, RepositoryError> {
        self.fetch_executions(
            sqlx::query("SELECT * FROM flow_executions ORDER BY updated_at DESC, id DESC LIMIT ?")
                .bind(limit as i64),
        )
        .await
    }

    async fn append_log(&self, entry: &ExecutionLogEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO flow_execution_logs
               (id, execution_id, step_index, step_id, step_type, outcome, message, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id.to_string())
        .bind(entry.execution_id.to_string())
        .bind(entry.step_index as i64)
        .bind(&entry.step_id)
        .bind(entry.step_type.as_str())
        .bind(entry.outcome.as_str())
        .bind(&entry.message)
        .bind(format_datetime(&entry.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_logs(&self, execution_id: &Uuid) -> Result<Vec<ExecutionLogEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM flow_execution_logs WHERE execution_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = LogRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            entries.push(r.into_entry()?);
        }
        Ok(entries)
    }
}
