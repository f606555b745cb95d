//! Starting executions and delivering subject replies.
//!
//! The launcher is the only writer that creates executions. It applies the
//! restart policy for a flow/subject pair that already has an active run and
//! publishes the first `step` trigger; the interpreter does the rest.

use std::sync::Arc;

use cadence_types::error::{FlowError, RepositoryError};
use cadence_types::execution::{ContextMap, ExecutionStatus, FlowExecution};
use cadence_types::flow::{
    FlowDefinition, LAST_RESPONSE_VAR, REPLY_BATCH_VAR, RESPONDED_VAR, StepCursor,
};
use cadence_types::message::{ExecutionTrigger, InboundEvent, TriggerKind};
use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::queue::transport::{BoxQueuePublisher, QueueError};
use crate::repository::execution::ExecutionRepository;
use crate::repository::flow::FlowRepository;
use crate::schedule::idle::{IdleArming, awaits_reply};

use super::library::StepLibrary;

/// Trigger types that always replace an active run of the same flow.
const SUPERSEDING_TRIGGERS: [&str; 2] = ["keyword", "manual"];

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error(transparent)]
    InvalidFlow(#[from] FlowError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartResult {
    Started(Uuid),
    /// An active run exists and the trigger does not replace it.
    Skipped { existing: Uuid },
}

pub struct FlowLauncher<E, F> {
    executions: Arc<E>,
    flows: Arc<F>,
    library: Arc<StepLibrary>,
    publisher: BoxQueuePublisher,
    idle: Option<IdleArming<E>>,
    stuck_after: chrono::Duration,
}

impl<E, F> FlowLauncher<E, F>
where
    E: ExecutionRepository + 'static,
    F: FlowRepository + 'static,
{
    pub fn new(
        executions: Arc<E>,
        flows: Arc<F>,
        library: Arc<StepLibrary>,
        publisher: BoxQueuePublisher,
        stuck_after_sec: u64,
    ) -> Self {
        Self {
            executions,
            flows,
            library,
            publisher,
            idle: None,
            stuck_after: chrono::Duration::seconds(stuck_after_sec as i64),
        }
    }

    pub fn with_idle_arming(mut self, idle: IdleArming<E>) -> Self {
        self.idle = Some(idle);
        self
    }

    /// Look a flow up by id, then by name.
    pub async fn resolve_flow(&self, flow_ref: &str) -> Result<FlowDefinition, LaunchError> {
        let by_id = match Uuid::parse_str(flow_ref) {
            Ok(id) => self.flows.get_flow(&id).await?,
            Err(_) => None,
        };
        let flow = match by_id {
            Some(flow) => Some(flow),
            None => self.flows.get_flow_by_name(flow_ref).await?,
        };
        flow.ok_or_else(|| LaunchError::FlowNotFound(flow_ref.to_string()))
    }

    /// Create an execution of `flow_ref` for `subject_id` and enqueue its
    /// first step.
    pub async fn start(
        &self,
        flow_ref: &str,
        subject_id: &str,
        trigger_type: &str,
        variables: ContextMap,
    ) -> Result<StartResult, LaunchError> {
        let flow = self.resolve_flow(flow_ref).await?;
        self.library.check_flow(&flow)?;

        let execution = FlowExecution::new(flow.id, subject_id, trigger_type, variables);

        if let Some(mut active) = self
            .executions
            .find_active_execution(&flow.id, subject_id)
            .await?
        {
            let stuck = Utc::now() - active.updated_at > self.stuck_after;
            if !stuck && !SUPERSEDING_TRIGGERS.contains(&trigger_type) {
                tracing::info!(
                    flow = %flow.name,
                    subject_id,
                    existing = %active.id,
                    trigger_type,
                    "active execution exists, start skipped"
                );
                return Ok(StartResult::Skipped {
                    existing: active.id,
                });
            }

            active.status = ExecutionStatus::Cancelled;
            active.resume_at = None;
            active.last_error = Some(format!("superseded by {}", execution.id));
            active.updated_at = Utc::now();
            self.executions.update_execution(&active).await?;
            tracing::info!(execution_id = %active.id, superseded_by = %execution.id, stuck, "execution cancelled");
        }

        self.executions.create_execution(&execution).await?;
        let mut trigger = ExecutionTrigger::step(execution.id);
        if let StepCursor::At(index) = execution.current_step {
            trigger = trigger.at_step(index);
        }
        self.publisher.publish_trigger(&trigger).await?;

        tracing::info!(
            execution_id = %execution.id,
            flow = %flow.name,
            subject_id,
            trigger_type,
            "execution started"
        );
        self.refresh_idle(subject_id).await;
        Ok(StartResult::Started(execution.id))
    }

    /// Resume every execution of the subject that is waiting for a reply with
    /// the batch. Returns the executions a `reply` trigger was published for;
    /// empty when nothing waits.
    pub async fn deliver_reply(
        &self,
        subject_id: &str,
        batch: &[InboundEvent],
    ) -> Result<Vec<Uuid>, LaunchError> {
        let waiting = self
            .executions
            .list_subject_executions(subject_id, ExecutionStatus::WaitingForEvent)
            .await?;

        let texts: Vec<&str> = batch.iter().map(|e| e.text.as_str()).collect();
        let mut payload = ContextMap::new();
        payload.insert(LAST_RESPONSE_VAR.into(), Value::String(texts.join("\n")));
        payload.insert(RESPONDED_VAR.into(), Value::Bool(true));
        payload.insert(REPLY_BATCH_VAR.into(), json!(texts));

        let mut resumed = Vec::new();
        for execution in waiting.iter().filter(|e| awaits_reply(e)) {
            let mut trigger = ExecutionTrigger::new(execution.id, TriggerKind::Reply)
                .with_payload(payload.clone());
            if let Some(index) = execution.current_step.index() {
                trigger = trigger.at_step(index);
            }
            self.publisher.publish_trigger(&trigger).await?;
            resumed.push(execution.id);
        }

        tracing::debug!(subject_id, batch = batch.len(), resumed = resumed.len(), "reply delivered");
        Ok(resumed)
    }

    async fn refresh_idle(&self, subject_id: &str) {
        if let Some(idle) = &self.idle {
            if let Err(e) = idle.refresh(subject_id).await {
                tracing::warn!(subject_id, error = %e, "failed to refresh idle timer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::definition::parse_flow_json;
    use crate::flow::outbound::fakes::{EchoTools, RecordingChannel};
    use crate::queue::memory::MemoryQueue;
    use crate::repository::memory::MemoryStore;
    use cadence_types::flow::WAITING_FOR_RESPONSE_VAR;
    use cadence_types::message::FLOW_EXECUTION_TOPIC;

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        launcher: FlowLauncher<MemoryStore, MemoryStore>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(64));
        let flow = parse_flow_json(
            r#"{"name":"welcome","steps":[
                {"id":"hello","config":{"type":"send_message","text":"hi"}},
                {"id":"ask","config":{"type":"wait_for_reply"}}
            ]}"#,
        )
        .unwrap();
        store.save_flow(&flow).await.unwrap();

        let library = StepLibrary::builtin(
            Arc::new(RecordingChannel::default()),
            Arc::new(EchoTools::default()),
        );
        let launcher = FlowLauncher::new(
            store.clone(),
            store.clone(),
            Arc::new(library),
            BoxQueuePublisher::new(queue.clone()),
            900,
        );
        Fixture {
            store,
            queue,
            launcher,
        }
    }

    async fn drain(queue: &MemoryQueue) -> Vec<ExecutionTrigger> {
        let mut out = Vec::new();
        while let Some(delivery) = queue.try_receive(FLOW_EXECUTION_TOPIC).await {
            out.push(serde_json::from_slice(&delivery.body).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_start_creates_running_execution_and_enqueues_first_step() {
        let f = fixture().await;
        let StartResult::Started(id) = f
            .launcher
            .start("welcome", "s1", "keyword", ContextMap::new())
            .await
            .unwrap()
        else {
            panic!("expected start");
        };

        let exec = f.store.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.current_step, StepCursor::At(0));
        assert_eq!(exec.trigger_type, "keyword");

        let triggers = drain(&f.queue).await;
        assert_eq!(triggers, vec![ExecutionTrigger::step(id).at_step(0)]);
    }

    #[tokio::test]
    async fn test_start_by_id_and_unknown_flow() {
        let f = fixture().await;
        let flow = f.store.get_flow_by_name("welcome").await.unwrap().unwrap();
        assert!(matches!(
            f.launcher
                .start(&flow.id.to_string(), "s1", "manual", ContextMap::new())
                .await
                .unwrap(),
            StartResult::Started(_)
        ));
        assert!(matches!(
            f.launcher.start("nope", "s1", "manual", ContextMap::new()).await,
            Err(LaunchError::FlowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_non_superseding_trigger_skips_active_run() {
        let f = fixture().await;
        let StartResult::Started(first) = f
            .launcher
            .start("welcome", "s1", "schedule", ContextMap::new())
            .await
            .unwrap()
        else {
            panic!("expected start");
        };

        let second = f
            .launcher
            .start("welcome", "s1", "schedule", ContextMap::new())
            .await
            .unwrap();
        assert_eq!(second, StartResult::Skipped { existing: first });
    }

    #[tokio::test]
    async fn test_keyword_trigger_supersedes_active_run() {
        let f = fixture().await;
        let StartResult::Started(first) = f
            .launcher
            .start("welcome", "s1", "schedule", ContextMap::new())
            .await
            .unwrap()
        else {
            panic!("expected start");
        };
        let StartResult::Started(second) = f
            .launcher
            .start("welcome", "s1", "keyword", ContextMap::new())
            .await
            .unwrap()
        else {
            panic!("expected supersede");
        };

        let old = f.store.get_execution(&first).await.unwrap().unwrap();
        assert_eq!(old.status, ExecutionStatus::Cancelled);
        assert!(old.last_error.unwrap().contains(&second.to_string()));
    }

    #[tokio::test]
    async fn test_stuck_run_is_superseded() {
        let f = fixture().await;
        let flow = f.store.get_flow_by_name("welcome").await.unwrap().unwrap();
        let mut stale = FlowExecution::new(flow.id, "s1", "schedule", ContextMap::new());
        stale.updated_at = Utc::now() - chrono::Duration::hours(2);
        f.store.create_execution(&stale).await.unwrap();

        let result = f
            .launcher
            .start("welcome", "s1", "schedule", ContextMap::new())
            .await
            .unwrap();
        assert!(matches!(result, StartResult::Started(_)));
        let old = f.store.get_execution(&stale.id).await.unwrap().unwrap();
        assert_eq!(old.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unsupported_step_type_rejected() {
        let f = fixture().await;
        let launcher = FlowLauncher::new(
            f.store.clone(),
            f.store.clone(),
            Arc::new(StepLibrary::new()),
            BoxQueuePublisher::new(f.queue.clone()),
            900,
        );
        assert!(matches!(
            launcher.start("welcome", "s1", "manual", ContextMap::new()).await,
            Err(LaunchError::InvalidFlow(_))
        ));
        assert!(drain(&f.queue).await.is_empty());
    }

    #[tokio::test]
    async fn test_deliver_reply_targets_only_reply_waiters() {
        let f = fixture().await;
        let flow = f.store.get_flow_by_name("welcome").await.unwrap().unwrap();

        let mut waiting = FlowExecution::new(flow.id, "s1", "manual", ContextMap::new());
        waiting.status = ExecutionStatus::WaitingForEvent;
        waiting.current_step = StepCursor::At(1);
        waiting
            .context
            .insert(WAITING_FOR_RESPONSE_VAR.into(), Value::Bool(true));
        let mut delayed = FlowExecution::new(flow.id, "s1", "manual", ContextMap::new());
        delayed.status = ExecutionStatus::WaitingForEvent;
        f.store.create_execution(&waiting).await.unwrap();
        f.store.create_execution(&delayed).await.unwrap();

        let batch = vec![InboundEvent::text("s1", "a"), InboundEvent::text("s1", "b")];
        let resumed = f.launcher.deliver_reply("s1", &batch).await.unwrap();
        assert_eq!(resumed, vec![waiting.id]);

        let triggers = drain(&f.queue).await;
        assert_eq!(triggers.len(), 1);
        let trigger = &triggers[0];
        assert_eq!(trigger.kind, TriggerKind::Reply);
        assert_eq!(trigger.step_index, Some(1));
        assert_eq!(trigger.payload[LAST_RESPONSE_VAR], json!("a\nb"));
        assert_eq!(trigger.payload[RESPONDED_VAR], json!(true));
        assert_eq!(trigger.payload[REPLY_BATCH_VAR], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_deliver_reply_with_nobody_waiting() {
        let f = fixture().await;
        let resumed = f
            .launcher
            .deliver_reply("s1", &[InboundEvent::text("s1", "hi")])
            .await
            .unwrap();
        assert!(resumed.is_empty());
    }
}
