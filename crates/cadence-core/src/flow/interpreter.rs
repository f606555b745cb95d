//! Flow Step Interpreter.
//!
//! `advance` loads one execution under its per-execution lock, checks that the
//! trigger still applies to the stored state, runs the current step through
//! the step library, and persists the resulting transition before the lock is
//! released. Consecutive non-suspending steps run in the same call, one
//! persisted transition per step, until the execution suspends, terminates,
//! fails, or the per-call step budget runs out.
//!
//! # Trigger guard
//!
//! - `COMPLETED`, `FAILED`, `CANCELLED`: no-op, same terminal outcome.
//! - `step` / `manual` triggers act only on `RUNNING`.
//! - `reply` / `idle_timeout` / `delay_elapsed` act only on `WAITING_FOR_EVENT`.
//! - A trigger carrying a `step_index` other than the stored cursor is stale.

use std::sync::Arc;
use std::time::Duration;

use cadence_types::config::InterpreterConfig;
use cadence_types::error::RepositoryError;
use cadence_types::execution::{
    ExecutionLogEntry, ExecutionStatus, FlowExecution, StepLogOutcome,
};
use cadence_types::flow::{FlowDefinition, StepCursor, StepDefinition};
use cadence_types::message::ExecutionTrigger;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::queue::transport::BoxQueuePublisher;
use crate::repository::execution::ExecutionRepository;
use crate::repository::flow::FlowRepository;
use crate::schedule::idle::IdleArming;

use super::context::{Resume, StepContext};
use super::library::{StepLibrary, StepOutcome};
use super::lock::ExecutionLocks;

// ---------------------------------------------------------------------------
// Outcome and error types
// ---------------------------------------------------------------------------

/// Result of one `advance` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    /// The execution had already failed; nothing ran.
    Failed { reason: Option<String> },
    Cancelled,
    /// Still running after the step budget; a continuation was enqueued.
    Advanced { step_index: usize },
    Suspended {
        step_index: usize,
        resume_at: Option<DateTime<Utc>>,
    },
    /// The trigger no longer applies to the stored state.
    Unchanged { status: ExecutionStatus },
}

/// A step handler failed or returned `Fail`. The execution is now `FAILED`.
#[derive(Debug, Error)]
#[error("execution {execution_id} failed at step {step_index} ('{step_id}'): {reason}")]
pub struct StepError {
    pub execution_id: Uuid,
    pub step_index: usize,
    pub step_id: String,
    pub reason: String,
}

/// Errors returned by the interpreter.
#[derive(Debug, Error)]
pub enum AdvanceError {
    /// The execution does not exist; the trigger is stale.
    #[error("execution {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Step(#[from] StepError),

    /// Another task holds the execution or won the optimistic write.
    #[error("execution {0} is being advanced elsewhere")]
    LockContention(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Failure categories that decide how a queue delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unparseable body. Never retried.
    Malformed,
    /// Stale trigger for a missing execution.
    NotFound,
    /// Step handler failure; the execution is `FAILED`.
    Step,
    /// Transient contention on the execution.
    LockContention,
    /// Store failure; handled like contention.
    Infrastructure,
}

impl ErrorCategory {
    /// Whether a retry may succeed.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::LockContention | Self::Infrastructure)
    }
}

impl AdvanceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Step(_) => ErrorCategory::Step,
            Self::LockContention(_) => ErrorCategory::LockContention,
            Self::Repository(_) => ErrorCategory::Infrastructure,
        }
    }
}

/// Anything that can advance an execution for a queue trigger.
pub trait ExecutionAdvancer: Send + Sync {
    fn advance_trigger(
        &self,
        trigger: &ExecutionTrigger,
    ) -> impl std::future::Future<Output = Result<ExecutionOutcome, AdvanceError>> + Send;
}

// ---------------------------------------------------------------------------
// FlowInterpreter
// ---------------------------------------------------------------------------

pub struct FlowInterpreter<E, F> {
    executions: Arc<E>,
    flows: Arc<F>,
    library: Arc<StepLibrary>,
    publisher: BoxQueuePublisher,
    locks: ExecutionLocks,
    /// Cached by id; an entry is reused only while its `version` matches
    /// the stored one.
    flow_cache: DashMap<Uuid, Arc<FlowDefinition>>,
    idle: Option<IdleArming<E>>,
    config: InterpreterConfig,
}

impl<E, F> FlowInterpreter<E, F>
where
    E: ExecutionRepository + 'static,
    F: FlowRepository + 'static,
{
    pub fn new(
        executions: Arc<E>,
        flows: Arc<F>,
        library: Arc<StepLibrary>,
        publisher: BoxQueuePublisher,
        config: InterpreterConfig,
    ) -> Self {
        Self {
            executions,
            flows,
            library,
            publisher,
            locks: ExecutionLocks::new(),
            flow_cache: DashMap::new(),
            idle: None,
            config,
        }
    }

    /// Re-arm the idle timer after every advancement.
    pub fn with_idle_arming(mut self, idle: IdleArming<E>) -> Self {
        self.idle = Some(idle);
        self
    }

    /// Advance a running execution (plain `{ execution_id }` trigger).
    pub async fn advance(&self, execution_id: Uuid) -> Result<ExecutionOutcome, AdvanceError> {
        self.advance_trigger(&ExecutionTrigger::step(execution_id))
            .await
    }

    async fn run_trigger(
        &self,
        trigger: &ExecutionTrigger,
    ) -> Result<ExecutionOutcome, AdvanceError> {
        let id = trigger.execution_id;
        let timeout = Duration::from_millis(self.config.lock_timeout_ms);
        let _guard = self
            .locks
            .acquire(id, timeout)
            .await
            .ok_or(AdvanceError::LockContention(id))?;

        let mut execution = self
            .executions
            .get_execution(&id)
            .await?
            .ok_or(AdvanceError::NotFound(id))?;

        if let Some(outcome) = terminal_outcome(&execution) {
            tracing::debug!(execution_id = %id, status = %execution.status, "execution already terminal");
            return Ok(outcome);
        }

        if !accepts(&execution, trigger) {
            tracing::debug!(
                execution_id = %id,
                status = %execution.status,
                step = %execution.current_step,
                kind = ?trigger.kind,
                trigger_step = ?trigger.step_index,
                "stale trigger ignored"
            );
            return Ok(ExecutionOutcome::Unchanged {
                status: execution.status,
            });
        }

        let resume = match execution.status {
            ExecutionStatus::WaitingForEvent => Resume::from_trigger(trigger.kind),
            _ => None,
        };
        execution.apply_patch(trigger.payload.clone());

        let result = match self.load_flow(&execution.flow_id).await? {
            Some(flow) => self.run_steps(&mut execution, &flow, resume).await,
            None => {
                let reason = format!("flow {} not found", execution.flow_id);
                self.fail(&mut execution, None, reason).await
            }
        };

        if let Some(idle) = &self.idle {
            if let Err(e) = idle.refresh(&execution.subject_id).await {
                tracing::warn!(subject_id = %execution.subject_id, error = %e, "failed to refresh idle timer");
            }
        }
        result
    }

    async fn load_flow(&self, flow_id: &Uuid) -> Result<Option<Arc<FlowDefinition>>, AdvanceError> {
        let Some(version) = self.flows.get_flow_version(flow_id).await? else {
            self.flow_cache.remove(flow_id);
            return Ok(None);
        };
        if let Some(flow) = self.flow_cache.get(flow_id) {
            if flow.version == version {
                return Ok(Some(flow.clone()));
            }
        }
        let Some(flow) = self.flows.get_flow(flow_id).await? else {
            return Ok(None);
        };
        tracing::debug!(flow_id = %flow_id, version = flow.version, "flow definition loaded");
        let flow = Arc::new(flow);
        self.flow_cache.insert(*flow_id, flow.clone());
        Ok(Some(flow))
    }

    async fn run_steps(
        &self,
        execution: &mut FlowExecution,
        flow: &Arc<FlowDefinition>,
        mut resume: Option<Resume>,
    ) -> Result<ExecutionOutcome, AdvanceError> {
        for _ in 0..self.config.max_steps_per_advance.max(1) {
            let index = match execution.current_step {
                StepCursor::At(index) => index,
                StepCursor::Terminal => {
                    execution.status = ExecutionStatus::Completed;
                    execution.resume_at = None;
                    self.persist(execution).await?;
                    return Ok(ExecutionOutcome::Completed);
                }
            };
            let Some(step) = flow.steps.get(index) else {
                let reason = format!("step index {index} outside flow '{}'", flow.name);
                return self.fail(execution, None, reason).await;
            };

            let ctx = StepContext {
                execution_id: execution.id,
                subject_id: execution.subject_id.clone(),
                step_index: index,
                flow: flow.clone(),
                variables: execution.context.clone(),
                resume: resume.take(),
                resume_at: execution.resume_at,
                now: Utc::now(),
            };

            let outcome = match self.library.handle(step, &ctx).await {
                Ok(outcome) => outcome,
                Err(e) => return self.fail(execution, Some((index, step)), e.to_string()).await,
            };

            match outcome {
                StepOutcome::Advance { next, patch } | StepOutcome::Branch { target: next, patch } => {
                    let branched = next != flow.next_after(index);
                    execution.apply_patch(patch);
                    execution.current_step = next;
                    execution.resume_at = None;
                    execution.status = if next.is_terminal() {
                        ExecutionStatus::Completed
                    } else {
                        ExecutionStatus::Running
                    };
                    self.persist(execution).await?;

                    let log_outcome = match (next.is_terminal(), branched) {
                        (true, _) => StepLogOutcome::Completed,
                        (false, true) => StepLogOutcome::Branched,
                        (false, false) => StepLogOutcome::Advanced,
                    };
                    self.log_step(execution, index, step, log_outcome, Some(format!("next: {next}")))
                        .await;
                    tracing::debug!(
                        execution_id = %execution.id,
                        step_index = index,
                        step_type = %step.step_type(),
                        next = %next,
                        "step advanced"
                    );

                    if next.is_terminal() {
                        tracing::info!(execution_id = %execution.id, "execution completed");
                        return Ok(ExecutionOutcome::Completed);
                    }
                }
                StepOutcome::Suspend { patch, resume_at } => {
                    execution.apply_patch(patch);
                    execution.status = ExecutionStatus::WaitingForEvent;
                    execution.resume_at = resume_at;
                    self.persist(execution).await?;

                    let message = resume_at.map(|at| format!("resume at {}", at.to_rfc3339()));
                    self.log_step(execution, index, step, StepLogOutcome::Suspended, message)
                        .await;
                    tracing::debug!(
                        execution_id = %execution.id,
                        step_index = index,
                        step_type = %step.step_type(),
                        resume_at = ?resume_at,
                        "execution suspended"
                    );
                    return Ok(ExecutionOutcome::Suspended {
                        step_index: index,
                        resume_at,
                    });
                }
                StepOutcome::Fail { reason } => {
                    return self.fail(execution, Some((index, step)), reason).await;
                }
            }
        }

        // Budget exhausted while still running: hand the rest to the queue.
        let step_index = execution.current_step.index().unwrap_or_default();
        let continuation = ExecutionTrigger::step(execution.id).at_step(step_index);
        if let Err(e) = self.publisher.publish_trigger_nowait(&continuation).await {
            tracing::warn!(
                execution_id = %execution.id,
                error = %e,
                "failed to enqueue continuation; stalled-run sweep will pick it up"
            );
        }
        Ok(ExecutionOutcome::Advanced { step_index })
    }

    /// Mark the execution `FAILED` and return the matching `StepError`.
    async fn fail(
        &self,
        execution: &mut FlowExecution,
        step: Option<(usize, &StepDefinition)>,
        reason: String,
    ) -> Result<ExecutionOutcome, AdvanceError> {
        execution.status = ExecutionStatus::Failed;
        execution.last_error = Some(reason.clone());
        execution.resume_at = None;
        self.persist(execution).await?;

        let step_index = step
            .map(|(index, _)| index)
            .or(execution.current_step.index())
            .unwrap_or_default();
        let step_id = step.map(|(_, s)| s.id.clone()).unwrap_or_default();
        if let Some((index, step)) = step {
            self.log_step(execution, index, step, StepLogOutcome::Failed, Some(reason.clone()))
                .await;
        }
        tracing::error!(
            execution_id = %execution.id,
            subject_id = %execution.subject_id,
            step_index,
            step_id = %step_id,
            reason = %reason,
            "execution failed"
        );

        Err(AdvanceError::Step(StepError {
            execution_id: execution.id,
            step_index,
            step_id,
            reason,
        }))
    }

    /// Write the execution back under its optimistic version.
    async fn persist(&self, execution: &mut FlowExecution) -> Result<(), AdvanceError> {
        execution.updated_at = Utc::now();
        match self.executions.update_execution(execution).await {
            Ok(version) => {
                execution.version = version;
                Ok(())
            }
            Err(RepositoryError::Conflict(_)) => Err(AdvanceError::LockContention(execution.id)),
            Err(RepositoryError::NotFound) => Err(AdvanceError::NotFound(execution.id)),
            Err(e) => Err(AdvanceError::Repository(e)),
        }
    }

    async fn log_step(
        &self,
        execution: &FlowExecution,
        index: usize,
        step: &StepDefinition,
        outcome: StepLogOutcome,
        message: Option<String>,
    ) {
        let entry = ExecutionLogEntry {
            id: Uuid::now_v7(),
            execution_id: execution.id,
            step_index: index,
            step_id: step.id.clone(),
            step_type: step.step_type(),
            outcome,
            message,
            created_at: Utc::now(),
        };
        if let Err(e) = self.executions.append_log(&entry).await {
            tracing::warn!(execution_id = %execution.id, error = %e, "failed to append execution log");
        }
    }
}

impl<E, F> ExecutionAdvancer for FlowInterpreter<E, F>
where
    E: ExecutionRepository + 'static,
    F: FlowRepository + 'static,
{
    async fn advance_trigger(
        &self,
        trigger: &ExecutionTrigger,
    ) -> Result<ExecutionOutcome, AdvanceError> {
        self.run_trigger(trigger).await
    }
}

fn terminal_outcome(execution: &FlowExecution) -> Option<ExecutionOutcome> {
    match execution.status {
        ExecutionStatus::Completed => Some(ExecutionOutcome::Completed),
        ExecutionStatus::Failed => Some(ExecutionOutcome::Failed {
            reason: execution.last_error.clone(),
        }),
        ExecutionStatus::Cancelled => Some(ExecutionOutcome::Cancelled),
        ExecutionStatus::Running | ExecutionStatus::WaitingForEvent => None,
    }
}

fn accepts(execution: &FlowExecution, trigger: &ExecutionTrigger) -> bool {
    if let Some(index) = trigger.step_index {
        if execution.current_step.index() != Some(index) {
            return false;
        }
    }
    match execution.status {
        ExecutionStatus::Running => !trigger.kind.is_resume(),
        ExecutionStatus::WaitingForEvent => trigger.kind.is_resume(),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::outbound::fakes::{EchoTools, RecordingChannel};
    use crate::queue::memory::MemoryQueue;
    use crate::queue::transport::QueuePublisher;
    use crate::repository::memory::MemoryStore;
    use cadence_types::execution::ContextMap;
    use cadence_types::message::{FLOW_EXECUTION_TOPIC, TriggerKind};
    use serde_json::json;

    pub(crate) struct Harness {
        pub store: Arc<MemoryStore>,
        pub queue: Arc<MemoryQueue>,
        pub channel: Arc<RecordingChannel>,
        pub interpreter: Arc<FlowInterpreter<MemoryStore, MemoryStore>>,
    }

    fn harness_with(channel: RecordingChannel, config: InterpreterConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(64));
        let channel = Arc::new(channel);
        let library = Arc::new(StepLibrary::builtin(
            channel.clone(),
            Arc::new(EchoTools::default()),
        ));
        let interpreter = Arc::new(FlowInterpreter::new(
            store.clone(),
            store.clone(),
            library,
            BoxQueuePublisher::new(queue.clone()),
            config,
        ));
        Harness {
            store,
            queue,
            channel,
            interpreter,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingChannel::default(), InterpreterConfig::default())
    }

    async fn start(h: &Harness, steps: serde_json::Value) -> Uuid {
        let flow: FlowDefinition =
            serde_json::from_value(json!({ "name": format!("flow-{}", Uuid::now_v7()), "steps": steps }))
                .unwrap();
        h.store.save_flow(&flow).await.unwrap();
        let exec = FlowExecution::new(flow.id, "chat-1", "manual", ContextMap::new());
        h.store.create_execution(&exec).await.unwrap();
        exec.id
    }

    fn send(id: &str, text: &str) -> serde_json::Value {
        json!({ "id": id, "config": { "type": "send_message", "text": text } })
    }

    fn wait(id: &str) -> serde_json::Value {
        json!({ "id": id, "config": { "type": "wait_for_reply" } })
    }

    async fn load(h: &Harness, id: Uuid) -> FlowExecution {
        h.store.get_execution(&id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_send_wait_send_suspends_at_wait() {
        let h = harness();
        let id = start(&h, json!([send("a", "one"), wait("b"), send("c", "two")])).await;

        let outcome = h.interpreter.advance(id).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Suspended {
                step_index: 1,
                resume_at: None
            }
        );

        let exec = load(&h, id).await;
        assert_eq!(exec.status, ExecutionStatus::WaitingForEvent);
        assert_eq!(exec.current_step, StepCursor::At(1));
        assert_eq!(h.channel.sent().len(), 1);
        assert_eq!(h.channel.sent()[0].idempotency_key, format!("{id}-0"));
    }

    #[tokio::test]
    async fn test_reply_resumes_to_completion() {
        let h = harness();
        let id = start(&h, json!([send("a", "one"), wait("b"), send("c", "got {{ last_response }}")])).await;
        h.interpreter.advance(id).await.unwrap();

        let mut payload = ContextMap::new();
        payload.insert("last_response".into(), json!("hello"));
        let reply = ExecutionTrigger::new(id, TriggerKind::Reply)
            .at_step(1)
            .with_payload(payload);
        let outcome = h.interpreter.advance_trigger(&reply).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);

        let exec = load(&h, id).await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.current_step, StepCursor::Terminal);
        assert_eq!(exec.context["last_response"], json!("hello"));
        assert_eq!(h.channel.sent()[1].text, "got hello");
    }

    #[tokio::test]
    async fn test_terminal_advance_is_noop() {
        let h = harness();
        let id = start(&h, json!([send("a", "only")])).await;
        assert_eq!(
            h.interpreter.advance(id).await.unwrap(),
            ExecutionOutcome::Completed
        );
        let version = load(&h, id).await.version;

        for _ in 0..3 {
            assert_eq!(
                h.interpreter.advance(id).await.unwrap(),
                ExecutionOutcome::Completed
            );
        }
        assert_eq!(load(&h, id).await.version, version);
        assert_eq!(h.channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_marks_failed_and_stays_failed() {
        let h = harness_with(RecordingChannel::failing(), InterpreterConfig::default());
        let id = start(&h, json!([send("a", "boom"), send("b", "never")])).await;

        let err = h.interpreter.advance(id).await.unwrap_err();
        match err {
            AdvanceError::Step(step) => {
                assert_eq!(step.step_index, 0);
                assert_eq!(step.step_id, "a");
            }
            other => panic!("expected step error, got {other:?}"),
        }

        let exec = load(&h, id).await;
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.last_error.is_some());

        let again = h.interpreter.advance(id).await.unwrap();
        assert_eq!(
            again,
            ExecutionOutcome::Failed {
                reason: exec.last_error.clone()
            }
        );
        let logs = h.store.list_logs(&id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, StepLogOutcome::Failed);
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_other_executions() {
        let h = harness();
        let bad = start(
            &h,
            json!([{ "id": "t", "config": { "type": "branch", "condition": { "op": "exists" }, "then": "t", "else": "gone" } }]),
        )
        .await;
        let good = start(&h, json!([send("a", "fine")])).await;

        assert!(h.interpreter.advance(bad).await.is_err());
        assert_eq!(
            h.interpreter.advance(good).await.unwrap(),
            ExecutionOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_reimported_flow_replaces_cached_definition() {
        let h = harness();
        let id = start(&h, json!([wait("a"), send("b", "old text")])).await;
        h.interpreter.advance(id).await.unwrap();

        let exec = load(&h, id).await;
        let mut flow = h.store.get_flow(&exec.flow_id).await.unwrap().unwrap();
        flow.steps[1] = serde_json::from_value(send("b", "new text")).unwrap();
        flow.version += 1;
        h.store.save_flow(&flow).await.unwrap();

        let reply = ExecutionTrigger::new(id, TriggerKind::Reply).at_step(0);
        assert_eq!(
            h.interpreter.advance_trigger(&reply).await.unwrap(),
            ExecutionOutcome::Completed
        );
        assert_eq!(h.channel.sent()[0].text, "new text");
    }

    #[tokio::test]
    async fn test_unrepresentable_delay_fails_execution() {
        let h = harness();
        let id = start(
            &h,
            json!([{ "id": "nap", "config": { "type": "delay", "seconds": 10_000_000_000_000u64 } }]),
        )
        .await;

        assert!(matches!(
            h.interpreter.advance(id).await,
            Err(AdvanceError::Step(_))
        ));
        let exec = load(&h, id).await;
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.resume_at.is_none());
    }

    #[tokio::test]
    async fn test_missing_execution_is_not_found() {
        let h = harness();
        let err = h.interpreter.advance(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, AdvanceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resume_trigger_on_running_is_stale() {
        let h = harness();
        let id = start(&h, json!([send("a", "one"), wait("b")])).await;
        let outcome = h
            .interpreter
            .advance_trigger(&ExecutionTrigger::new(id, TriggerKind::IdleTimeout))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Unchanged {
                status: ExecutionStatus::Running
            }
        );
        assert!(h.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn test_step_index_mismatch_is_stale() {
        let h = harness();
        let id = start(&h, json!([wait("a"), send("b", "x")])).await;
        h.interpreter.advance(id).await.unwrap();

        let stale = ExecutionTrigger::new(id, TriggerKind::Reply).at_step(5);
        let outcome = h.interpreter.advance_trigger(&stale).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Unchanged {
                status: ExecutionStatus::WaitingForEvent
            }
        );
    }

    #[tokio::test]
    async fn test_step_budget_enqueues_continuation() {
        let config = InterpreterConfig {
            max_steps_per_advance: 2,
            ..InterpreterConfig::default()
        };
        let h = harness_with(RecordingChannel::default(), config);
        let id = start(&h, json!([send("a", "1"), send("b", "2"), send("c", "3")])).await;

        let outcome = h.interpreter.advance(id).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Advanced { step_index: 2 });

        let delivery = h.queue.try_receive(FLOW_EXECUTION_TOPIC).await.unwrap();
        let trigger: ExecutionTrigger = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(trigger.execution_id, id);
        assert_eq!(trigger.step_index, Some(2));

        assert_eq!(
            h.interpreter.advance_trigger(&trigger).await.unwrap(),
            ExecutionOutcome::Completed
        );
        assert_eq!(h.channel.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_continuation_does_not_wait_on_full_queue() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(1));
        let interpreter = FlowInterpreter::new(
            store.clone(),
            store.clone(),
            Arc::new(StepLibrary::builtin(
                Arc::new(RecordingChannel::default()),
                Arc::new(EchoTools::default()),
            )),
            BoxQueuePublisher::new(queue.clone()),
            InterpreterConfig {
                max_steps_per_advance: 1,
                ..InterpreterConfig::default()
            },
        );
        let flow: FlowDefinition =
            serde_json::from_value(json!({ "name": "two", "steps": [send("a", "1"), send("b", "2")] }))
                .unwrap();
        store.save_flow(&flow).await.unwrap();
        let exec = FlowExecution::new(flow.id, "chat-1", "manual", ContextMap::new());
        store.create_execution(&exec).await.unwrap();
        queue.publish(FLOW_EXECUTION_TOPIC, b"filler".to_vec()).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), interpreter.advance(exec.id))
            .await
            .expect("continuation blocked on a full queue")
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Advanced { step_index: 1 });
        assert_eq!(queue.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_flow_fails_execution() {
        let h = harness();
        let exec = FlowExecution::new(Uuid::now_v7(), "chat-1", "manual", ContextMap::new());
        h.store.create_execution(&exec).await.unwrap();

        assert!(matches!(
            h.interpreter.advance(exec.id).await,
            Err(AdvanceError::Step(_))
        ));
        assert_eq!(load(&h, exec.id).await.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_trigger_payload_merged_into_context() {
        let h = harness();
        let id = start(&h, json!([send("a", "order {{ order_id }}")])).await;
        let mut payload = ContextMap::new();
        payload.insert("order_id".into(), json!("A-17"));
        h.interpreter
            .advance_trigger(&ExecutionTrigger::step(id).with_payload(payload))
            .await
            .unwrap();
        assert_eq!(h.channel.sent()[0].text, "order A-17");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_advance_sends_once() {
        let h = harness();
        let id = start(&h, json!([send("a", "one"), wait("b"), send("c", "two")])).await;

        let calls = (0..4).map(|_| {
            let interpreter = h.interpreter.clone();
            tokio::spawn(async move { interpreter.advance(id).await })
        });
        let results = futures_util::future::join_all(calls).await;

        let mut suspended = 0;
        let mut unchanged = 0;
        for result in results {
            match result.unwrap().unwrap() {
                ExecutionOutcome::Suspended { .. } => suspended += 1,
                ExecutionOutcome::Unchanged { .. } => unchanged += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(suspended, 1);
        assert_eq!(unchanged, 3);
        assert_eq!(h.channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_execution_log_records_each_step() {
        let h = harness();
        let id = start(&h, json!([send("a", "one"), wait("b")])).await;
        h.interpreter.advance(id).await.unwrap();

        let logs = h.store.list_logs(&id).await.unwrap();
        let outcomes: Vec<StepLogOutcome> = logs.iter().map(|l| l.outcome).collect();
        assert_eq!(
            outcomes,
            vec![StepLogOutcome::Advanced, StepLogOutcome::Suspended]
        );
    }
}
