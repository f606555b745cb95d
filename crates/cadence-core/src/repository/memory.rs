//! In-memory execution and flow store for tests and single-process use.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_types::error::RepositoryError;
use cadence_types::execution::{ExecutionLogEntry, ExecutionStatus, FlowExecution};
use cadence_types::flow::{FlowDefinition, FlowRecord};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::execution::ExecutionRepository;
use super::flow::FlowRepository;

/// In-memory implementation of [`ExecutionRepository`] and [`FlowRepository`].
///
/// Cloning shares the underlying maps.
#[derive(Clone, Default)]
pub struct MemoryStore {
    executions: Arc<RwLock<HashMap<Uuid, FlowExecution>>>,
    logs: Arc<RwLock<HashMap<Uuid, Vec<ExecutionLogEntry>>>>,
    flows: Arc<RwLock<HashMap<Uuid, FlowRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn filtered<P>(&self, predicate: P) -> Vec<FlowExecution>
    where
        P: Fn(&FlowExecution) -> bool,
    {
        let executions = self.executions.read().await;
        let mut matched: Vec<FlowExecution> = executions
            .values()
            .filter(|e| predicate(e))
            .cloned()
            .collect();
        matched.sort_by_key(|e| (e.updated_at, e.id));
        matched
    }
}

impl ExecutionRepository for MemoryStore {
    async fn create_execution(&self, execution: &FlowExecution) -> Result<(), RepositoryError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<FlowExecution>, RepositoryError> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn update_execution(&self, execution: &FlowExecution) -> Result<i64, RepositoryError> {
        let mut executions = self.executions.write().await;
        let stored = executions
            .get_mut(&execution.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.version != execution.version {
            return Err(RepositoryError::Conflict(format!(
                "execution {} version {} is stale (stored {})",
                execution.id, execution.version, stored.version
            )));
        }
        let next_version = execution.version + 1;
        *stored = execution.clone();
        stored.version = next_version;
        Ok(next_version)
    }

    async fn find_active_execution(
        &self,
        flow_id: &Uuid,
        subject_id: &str,
    ) -> Result<Option<FlowExecution>, RepositoryError> {
        let matched = self
            .filtered(|e| e.flow_id == *flow_id && e.subject_id == subject_id && e.status.is_active())
            .await;
        Ok(matched.into_iter().last())
    }

    async fn list_subject_executions(
        &self,
        subject_id: &str,
        status: ExecutionStatus,
    ) -> Result<Vec<FlowExecution>, RepositoryError> {
        Ok(self
            .filtered(|e| e.subject_id == subject_id && e.status == status)
            .await)
    }

    async fn list_executions_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<FlowExecution>, RepositoryError> {
        Ok(self.filtered(|e| e.status == status).await)
    }

    async fn list_due_executions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FlowExecution>, RepositoryError> {
        Ok(self
            .filtered(|e| {
                e.status == ExecutionStatus::WaitingForEvent
                    && e.resume_at.is_some_and(|at| at <= now)
            })
            .await)
    }

    async fn list_stalled_executions(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<FlowExecution>, RepositoryError> {
        Ok(self
            .filtered(|e| e.status == ExecutionStatus::Running && e.updated_at < before)
            .await)
    }

    async fn list_recent_executions(
        &self,
        limit: u32,
    ) -> Result<Vec<FlowExecution>, RepositoryError> {
        let mut all = self.filtered(|_| true).await;
        all.reverse();
        all.truncate(limit as usize);
        Ok(all)
    }

    async fn append_log(&self, entry: &ExecutionLogEntry) -> Result<(), RepositoryError> {
        self.logs
            .write()
            .await
            .entry(entry.execution_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, execution_id: &Uuid) -> Result<Vec<ExecutionLogEntry>, RepositoryError> {
        Ok(self
            .logs
            .read()
            .await
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }
}

impl FlowRepository for MemoryStore {
    async fn save_flow(&self, flow: &FlowDefinition) -> Result<(), RepositoryError> {
        let mut flows = self.flows.write().await;
        if flows
            .values()
            .any(|r| r.definition.name == flow.name && r.definition.id != flow.id)
        {
            return Err(RepositoryError::Conflict(format!(
                "flow name '{}' already exists",
                flow.name
            )));
        }
        let now = Utc::now();
        let created_at = flows.get(&flow.id).map_or(now, |r| r.created_at);
        flows.insert(
            flow.id,
            FlowRecord {
                definition: flow.clone(),
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn get_flow(&self, id: &Uuid) -> Result<Option<FlowDefinition>, RepositoryError> {
        Ok(self.flows.read().await.get(id).map(|r| r.definition.clone()))
    }

    async fn get_flow_version(&self, id: &Uuid) -> Result<Option<u32>, RepositoryError> {
        Ok(self.flows.read().await.get(id).map(|r| r.definition.version))
    }

    async fn get_flow_by_name(&self, name: &str) -> Result<Option<FlowDefinition>, RepositoryError> {
        Ok(self
            .flows
            .read()
            .await
            .values()
            .find(|r| r.definition.name == name)
            .map(|r| r.definition.clone()))
    }

    async fn list_flows(&self) -> Result<Vec<FlowRecord>, RepositoryError> {
        let mut flows: Vec<FlowRecord> = self.flows.read().await.values().cloned().collect();
        flows.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        Ok(flows)
    }

    async fn delete_flow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.flows.write().await.remove(id).is_some())
    }
}
