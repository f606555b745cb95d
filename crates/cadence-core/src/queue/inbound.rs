//! Inbound dispatcher.
//!
//! Every inbound subject message re-arms the subject's idle timer and passes
//! through the aggregation scheduler. Released batches resume the subject's
//! executions that wait for a reply; when none wait, the batch goes to the
//! agent reply sink instead.

use std::future::Future;
use std::sync::Arc;

use cadence_types::message::{AGENT_REPLY_TOPIC, AgentReplyRequest, INBOUND_TOPIC, InboundEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::flow::launcher::{FlowLauncher, LaunchError};
use crate::repository::execution::ExecutionRepository;
use crate::repository::flow::FlowRepository;
use crate::schedule::aggregation::{
    AggregationDecision, AggregationScheduler, ReleaseReason, ReleasedBatch,
};
use crate::schedule::idle::IdleArming;

use super::message::decode_inbound;
use super::transport::{BoxQueuePublisher, QueueError, QueueTransport};

/// Receives batches nobody's flow was waiting for.
pub trait AgentReplySink: Send + Sync {
    fn dispatch(&self, batch: &ReleasedBatch) -> impl Future<Output = Result<(), QueueError>> + Send;
}

/// Publishes an `AgentReplyRequest` onto the agent reply topic.
pub struct QueueReplySink {
    publisher: BoxQueuePublisher,
}

impl QueueReplySink {
    pub fn new(publisher: BoxQueuePublisher) -> Self {
        Self { publisher }
    }
}

impl AgentReplySink for QueueReplySink {
    async fn dispatch(&self, batch: &ReleasedBatch) -> Result<(), QueueError> {
        let request = AgentReplyRequest::from_batch(&batch.subject_id, batch.events.clone());
        self.publisher.publish_json(AGENT_REPLY_TOPIC, &request).await
    }
}

/// Where a released batch went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Flows(Vec<Uuid>),
    Agent,
}

pub struct InboundDispatcher<E, F, S> {
    aggregation: Arc<AggregationScheduler>,
    launcher: Arc<FlowLauncher<E, F>>,
    idle: Option<IdleArming<E>>,
    sink: S,
}

impl<E, F, S> InboundDispatcher<E, F, S>
where
    E: ExecutionRepository + 'static,
    F: FlowRepository + 'static,
    S: AgentReplySink,
{
    pub fn new(
        aggregation: Arc<AggregationScheduler>,
        launcher: Arc<FlowLauncher<E, F>>,
        sink: S,
    ) -> Self {
        Self {
            aggregation,
            launcher,
            idle: None,
            sink,
        }
    }

    pub fn with_idle_arming(mut self, idle: IdleArming<E>) -> Self {
        self.idle = Some(idle);
        self
    }

    /// Route one inbound event.
    pub async fn on_event(&self, event: InboundEvent) -> Result<AggregationDecision, LaunchError> {
        let subject_id = event.subject_id.clone();
        if let Some(idle) = &self.idle {
            idle.refresh(&subject_id).await?;
        }

        let decision = self.aggregation.observe(event).await;
        if let AggregationDecision::Release(events) = &decision {
            let reason = if self.aggregation.aggregation_enabled(&subject_id) {
                ReleaseReason::Cap
            } else {
                ReleaseReason::PassThrough
            };
            self.release(&ReleasedBatch {
                subject_id,
                events: events.clone(),
                reason,
            })
            .await?;
        }
        Ok(decision)
    }

    /// Hand a closed batch to waiting executions, or to the agent.
    pub async fn release(&self, batch: &ReleasedBatch) -> Result<Dispatched, LaunchError> {
        let resumed = self
            .launcher
            .deliver_reply(&batch.subject_id, &batch.events)
            .await?;
        if !resumed.is_empty() {
            return Ok(Dispatched::Flows(resumed));
        }
        self.sink.dispatch(batch).await?;
        tracing::debug!(
            subject_id = %batch.subject_id,
            batch = batch.events.len(),
            reason = ?batch.reason,
            "batch sent to agent"
        );
        Ok(Dispatched::Agent)
    }

    /// Dispatch batches released by the aggregation timer.
    pub async fn run_released(
        &self,
        mut rx: mpsc::Receiver<ReleasedBatch>,
        cancel: CancellationToken,
    ) {
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = rx.recv() => batch,
            };
            let Some(batch) = batch else { break };
            if let Err(e) = self.release(&batch).await {
                tracing::warn!(subject_id = %batch.subject_id, error = %e, "failed to dispatch released batch");
            }
        }
    }

    /// Consume the inbound topic until cancelled or the transport closes.
    /// Malformed messages are acknowledged and dropped; routing failures are
    /// rejected without requeue.
    pub async fn consume<T: QueueTransport>(&self, transport: &T, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = transport.receive(INBOUND_TOPIC) => received,
            };
            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "inbound receive failed");
                    break;
                }
            };

            let settled = match decode_inbound(&delivery.body) {
                Err(e) => {
                    tracing::warn!(delivery_tag = delivery.tag, error = %e, "discarding malformed inbound message");
                    transport.ack(&delivery).await
                }
                Ok(event) => match self.on_event(event).await {
                    Ok(_) => transport.ack(&delivery).await,
                    Err(e) => {
                        tracing::warn!(delivery_tag = delivery.tag, error = %e, "inbound message not routed");
                        transport.reject(&delivery, false).await
                    }
                },
            };
            if let Err(e) = settled {
                tracing::error!(delivery_tag = delivery.tag, error = %e, "failed to settle inbound delivery");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use cadence_types::agent::AgentSettings;
    use cadence_types::config::InterpreterConfig;
    use cadence_types::execution::{ContextMap, ExecutionStatus};
    use cadence_types::flow::{LAST_RESPONSE_VAR, TIMED_OUT_VAR};
    use cadence_types::message::{ExecutionTrigger, FLOW_EXECUTION_TOPIC, TriggerKind};
    use tokio::time::Instant;

    use crate::flow::definition::parse_flow_json;
    use crate::flow::interpreter::{ExecutionAdvancer, ExecutionOutcome, FlowInterpreter};
    use crate::flow::launcher::StartResult;
    use crate::flow::library::StepLibrary;
    use crate::flow::outbound::fakes::{EchoTools, RecordingChannel};
    use crate::queue::memory::MemoryQueue;
    use crate::queue::transport::QueuePublisher;
    use crate::repository::flow::FlowRepository as _;
    use crate::repository::memory::MemoryStore;
    use crate::schedule::idle::{IdleTimer, IdleTimerService};
    use crate::schedule::settings::SettingsSource;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<ReleasedBatch>>,
    }

    impl AgentReplySink for Arc<RecordingSink> {
        async fn dispatch(&self, batch: &ReleasedBatch) -> Result<(), QueueError> {
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    /// Store, queue, interpreter and dispatcher over one flow:
    /// wait_for_reply -> send_message.
    struct Engine {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        channel: Arc<RecordingChannel>,
        timer: Arc<IdleTimer>,
        interpreter: FlowInterpreter<MemoryStore, MemoryStore>,
        launcher: Arc<FlowLauncher<MemoryStore, MemoryStore>>,
        dispatcher: InboundDispatcher<MemoryStore, MemoryStore, Arc<RecordingSink>>,
        sink: Arc<RecordingSink>,
    }

    async fn engine(settings: AgentSettings) -> Engine {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(64));
        let channel = Arc::new(RecordingChannel::default());
        let settings: Arc<dyn SettingsSource> = Arc::new(settings);
        let publisher = BoxQueuePublisher::new(queue.clone());

        let flow = parse_flow_json(
            r#"{"name":"survey","steps":[
                {"id":"ask","config":{"type":"wait_for_reply","prompt":"How was it?"}},
                {"id":"thanks","config":{"type":"send_message","text":"Got: {{ last_response }}"}}
            ]}"#,
        )
        .unwrap();
        store.save_flow(&flow).await.unwrap();

        let library = Arc::new(StepLibrary::builtin(
            channel.clone(),
            Arc::new(EchoTools::default()),
        ));
        let timer = Arc::new(IdleTimer::new());
        let arming = IdleArming::new(timer.clone(), store.clone(), settings.clone());

        let interpreter = FlowInterpreter::new(
            store.clone(),
            store.clone(),
            library.clone(),
            publisher.clone(),
            InterpreterConfig::default(),
        )
        .with_idle_arming(arming.clone());
        let launcher = Arc::new(
            FlowLauncher::new(store.clone(), store.clone(), library, publisher, 900)
                .with_idle_arming(arming.clone()),
        );
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = InboundDispatcher::new(
            Arc::new(AggregationScheduler::new(settings)),
            launcher.clone(),
            sink.clone(),
        )
        .with_idle_arming(arming);

        Engine {
            store,
            queue,
            channel,
            timer,
            interpreter,
            launcher,
            dispatcher,
            sink,
        }
    }

    async fn next_trigger(queue: &MemoryQueue) -> ExecutionTrigger {
        let delivery = queue.receive(FLOW_EXECUTION_TOPIC).await.unwrap().unwrap();
        queue.ack(&delivery).await.unwrap();
        serde_json::from_slice(&delivery.body).unwrap()
    }

    async fn start_and_suspend(e: &Engine) -> Uuid {
        let StartResult::Started(id) = e
            .launcher
            .start("survey", "s1", "manual", ContextMap::new())
            .await
            .unwrap()
        else {
            panic!("expected start");
        };
        let trigger = next_trigger(&e.queue).await;
        let outcome = e.interpreter.advance_trigger(&trigger).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Suspended { step_index: 0, .. }));
        id
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_resumes_suspended_execution() {
        let e = engine(AgentSettings {
            reply_if_idle_sec: Some(30),
            ..AgentSettings::default()
        })
        .await;
        let cancel = CancellationToken::new();
        let service = IdleTimerService::new(
            e.timer.clone(),
            e.store.clone(),
            BoxQueuePublisher::new(e.queue.clone()),
        );
        let loop_handle = tokio::spawn(service.run(cancel.clone()));

        let suspended_at = Instant::now();
        let id = start_and_suspend(&e).await;
        assert_eq!(e.timer.pending_count().await, 1);

        let trigger = next_trigger(&e.queue).await;
        let waited = suspended_at.elapsed();
        assert!(waited >= Duration::from_secs(30));
        assert!(waited < Duration::from_secs(31));
        assert_eq!(trigger.execution_id, id);
        assert_eq!(trigger.kind, TriggerKind::IdleTimeout);

        let outcome = e.interpreter.advance_trigger(&trigger).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
        let exec = e.store.get_execution(&id).await.unwrap().unwrap();
        assert_ne!(exec.status, ExecutionStatus::WaitingForEvent);
        assert_eq!(exec.context[TIMED_OUT_VAR], serde_json::json!(true));
        assert_eq!(e.timer.pending_count().await, 0);

        cancel.cancel();
        loop_handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_batch_resumes_waiting_execution() {
        let e = engine(AgentSettings {
            aggregation_window_sec: 5,
            max_batch_messages: 2,
            ..AgentSettings::default()
        })
        .await;
        let id = start_and_suspend(&e).await;

        let first = e
            .dispatcher
            .on_event(InboundEvent::text("s1", "great"))
            .await
            .unwrap();
        assert_eq!(first, AggregationDecision::Buffered);
        let second = e
            .dispatcher
            .on_event(InboundEvent::text("s1", "thanks"))
            .await
            .unwrap();
        assert!(matches!(second, AggregationDecision::Release(ref b) if b.len() == 2));

        let trigger = next_trigger(&e.queue).await;
        assert_eq!(trigger.kind, TriggerKind::Reply);
        let outcome = e.interpreter.advance_trigger(&trigger).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);

        let exec = e.store.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(exec.context[LAST_RESPONSE_VAR], serde_json::json!("great\nthanks"));
        let sent = e.channel.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].text, "Got: great\nthanks");
        assert!(e.sink.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_goes_to_agent_when_nothing_waits() {
        let e = engine(AgentSettings {
            aggregation_enabled: false,
            ..AgentSettings::default()
        })
        .await;
        let decision = e
            .dispatcher
            .on_event(InboundEvent::text("s9", "hello"))
            .await
            .unwrap();
        assert!(matches!(decision, AggregationDecision::Release(_)));

        let batches = e.sink.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].reason, ReleaseReason::PassThrough);
        assert!(e.queue.try_receive(FLOW_EXECUTION_TOPIC).await.is_none());
    }

    #[tokio::test]
    async fn test_queue_sink_publishes_agent_request() {
        let queue = Arc::new(MemoryQueue::new(8));
        let sink = QueueReplySink::new(BoxQueuePublisher::new(queue.clone()));
        sink.dispatch(&ReleasedBatch {
            subject_id: "s1".into(),
            events: vec![InboundEvent::text("s1", "a"), InboundEvent::text("s1", "b")],
            reason: ReleaseReason::Timeout,
        })
        .await
        .unwrap();

        let delivery = queue.try_receive(AGENT_REPLY_TOPIC).await.unwrap();
        let request: AgentReplyRequest = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(request.subject_id, "s1");
        assert_eq!(request.text, "a\nb");
    }

    #[tokio::test]
    async fn test_consume_acks_malformed_and_routes_valid() {
        let e = engine(AgentSettings {
            aggregation_enabled: false,
            ..AgentSettings::default()
        })
        .await;
        e.queue.publish(INBOUND_TOPIC, b"{}".to_vec()).await.unwrap();
        e.queue
            .publish(INBOUND_TOPIC, br#"{"subject_id":"s2","text":"yo"}"#.to_vec())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let consume = e.dispatcher.consume(e.queue.as_ref(), cancel.clone());
        let wait = async {
            while e.queue.acked_count() < 2 {
                tokio::task::yield_now().await;
            }
            cancel.cancel();
        };
        tokio::join!(consume, wait);

        assert_eq!(e.sink.batches.lock().unwrap().len(), 1);
        assert!(e.queue.dead_letters().await.is_empty());
    }
}
