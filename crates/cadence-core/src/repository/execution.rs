//! Execution Store trait definition.
//!
//! The store exclusively owns `FlowExecution` durability. Writes are guarded
//! by an optimistic `version` column so that two processes racing on the same
//! execution cannot both commit a transition.

use cadence_types::error::RepositoryError;
use cadence_types::execution::{ExecutionLogEntry, ExecutionStatus, FlowExecution};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Repository trait for flow execution persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Insert a new execution.
    fn create_execution(
        &self,
        execution: &FlowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by ID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<FlowExecution>, RepositoryError>> + Send;

    /// Persist `execution` if the stored version still equals
    /// `execution.version`. Returns the new version.
    ///
    /// Returns `RepositoryError::Conflict` when the stored version moved on,
    /// and `RepositoryError::NotFound` when the row is gone.
    fn update_execution(
        &self,
        execution: &FlowExecution,
    ) -> impl std::future::Future<Output = Result<i64, RepositoryError>> + Send;

    /// The active (running or waiting) execution of `flow_id` for a subject.
    fn find_active_execution(
        &self,
        flow_id: &Uuid,
        subject_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<FlowExecution>, RepositoryError>> + Send;

    /// Executions of a subject in the given status, oldest first.
    fn list_subject_executions(
        &self,
        subject_id: &str,
        status: ExecutionStatus,
    ) -> impl std::future::Future<Output = Result<Vec<FlowExecution>, RepositoryError>> + Send;

    /// All executions in the given status, oldest update first.
    fn list_executions_by_status(
        &self,
        status: ExecutionStatus,
    ) -> impl std::future::Future<Output = Result<Vec<FlowExecution>, RepositoryError>> + Send;

    /// Waiting executions whose `resume_at` is at or before `now`.
    fn list_due_executions(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<FlowExecution>, RepositoryError>> + Send;

    /// Running executions not updated since `before`.
    fn list_stalled_executions(
        &self,
        before: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<FlowExecution>, RepositoryError>> + Send;

    /// Most recently updated executions, newest first.
    fn list_recent_executions(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<FlowExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Execution log
    // -----------------------------------------------------------------------

    /// Append a step attempt to the execution log.
    fn append_log(
        &self,
        entry: &ExecutionLogEntry,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Log entries of an execution in insertion order.
    fn list_logs(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionLogEntry>, RepositoryError>> + Send;
}
