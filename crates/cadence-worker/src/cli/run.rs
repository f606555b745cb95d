//! `cadence run`: the long-running worker.
//!
//! Wires the interpreter, consumer pool, aggregation and idle-timer loops and
//! the wake sweeper around one in-process queue. Worker input arrives as
//! newline-delimited JSON on stdin:
//!
//! ```text
//! {"type":"start","flow":"survey","subject_id":"chat-1"}
//! {"type":"inbound","subject_id":"chat-1","text":"great"}
//! {"type":"trigger","execution_id":"...","kind":"manual"}
//! {"type":"pause","subject_id":"chat-1","ttl_sec":1800}
//! {"type":"resume","subject_id":"chat-1"}
//! ```
//!
//! `pause` hands a subject to a human: its open aggregation window is dropped
//! and its messages are not aggregated until the TTL lapses or `resume`.
//!
//! Batches no flow is waiting for are written to stdout as agent reply
//! requests, one JSON object per line.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use cadence_core::flow::interpreter::FlowInterpreter;
use cadence_core::flow::launcher::{FlowLauncher, StartResult};
use cadence_core::queue::consumer::QueueConsumer;
use cadence_core::queue::inbound::{InboundDispatcher, QueueReplySink};
use cadence_core::queue::memory::MemoryQueue;
use cadence_core::queue::transport::{BoxQueuePublisher, QueueTransport};
use cadence_core::schedule::aggregation::AggregationScheduler;
use cadence_core::schedule::idle::{IdleArming, IdleTimer, IdleTimerService};
use cadence_core::schedule::settings::SettingsSource;
use cadence_core::schedule::wake::WakeSweeper;
use cadence_infra::sqlite::execution::SqliteExecutionRepository;
use cadence_infra::sqlite::flow::SqliteFlowRepository;
use cadence_types::config::EngineConfig;
use cadence_types::execution::ContextMap;
use cadence_types::message::{AGENT_REPLY_TOPIC, ExecutionTrigger, INBOUND_TOPIC, InboundEvent};

use crate::state::AppState;

type Executions = SqliteExecutionRepository;
type Flows = SqliteFlowRepository;

/// How long to wait for queued work to settle after stdin closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL: Duration = Duration::from_millis(25);
const DEFAULT_PAUSE_TTL_SEC: u64 = 3600;

/// One line of worker input.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerInput {
    /// Raw execution trigger, published on the flow execution queue.
    Trigger(ExecutionTrigger),
    /// Message from a subject, published on the inbound queue.
    Inbound(InboundEvent),
    Start {
        flow: String,
        subject_id: String,
        #[serde(default = "default_start_trigger")]
        trigger: String,
        #[serde(default)]
        vars: ContextMap,
    },
    /// Suspend aggregation for a subject (human takeover).
    Pause {
        subject_id: String,
        #[serde(default = "default_pause_ttl")]
        ttl_sec: u64,
    },
    /// Lift a pause early.
    Resume { subject_id: String },
}

fn default_start_trigger() -> String {
    "manual".to_string()
}

fn default_pause_ttl() -> u64 {
    DEFAULT_PAUSE_TTL_SEC
}

/// The wired engine. Loops are spawned by [`Worker::start`].
pub struct Worker {
    config: EngineConfig,
    consumers: usize,
    queue: Arc<MemoryQueue>,
    publisher: BoxQueuePublisher,
    executions: Arc<Executions>,
    timer: Arc<IdleTimer>,
    arming: IdleArming<Executions>,
    aggregation: Arc<AggregationScheduler>,
    launcher: Arc<FlowLauncher<Executions, Flows>>,
    dispatcher: Arc<InboundDispatcher<Executions, Flows, QueueReplySink>>,
    consumer: Arc<QueueConsumer<MemoryQueue, FlowInterpreter<Executions, Flows>>>,
}

impl Worker {
    pub fn build(state: &AppState, consumers: usize) -> Self {
        let config = state.config.clone();
        let queue = Arc::new(MemoryQueue::new(config.queue.capacity));
        let publisher = BoxQueuePublisher::new(queue.clone());
        let settings: Arc<dyn SettingsSource> = state.settings.clone();

        let timer = Arc::new(IdleTimer::new());
        let arming = IdleArming::new(timer.clone(), state.executions.clone(), settings.clone());

        let interpreter = FlowInterpreter::new(
            state.executions.clone(),
            state.flows.clone(),
            state.library.clone(),
            publisher.clone(),
            config.interpreter.clone(),
        )
        .with_idle_arming(arming.clone());
        let consumer = Arc::new(QueueConsumer::new(
            queue.clone(),
            Arc::new(interpreter),
            config.queue.clone(),
        ));

        let launcher = Arc::new(
            FlowLauncher::new(
                state.executions.clone(),
                state.flows.clone(),
                state.library.clone(),
                publisher.clone(),
                config.interpreter.stuck_after_sec,
            )
            .with_idle_arming(arming.clone()),
        );

        let aggregation = Arc::new(AggregationScheduler::new(settings));
        let dispatcher = Arc::new(
            InboundDispatcher::new(
                aggregation.clone(),
                launcher.clone(),
                QueueReplySink::new(publisher.clone()),
            )
            .with_idle_arming(arming.clone()),
        );

        Self {
            config,
            consumers: consumers.max(1),
            queue,
            publisher,
            executions: state.executions.clone(),
            timer,
            arming,
            aggregation,
            launcher,
            dispatcher,
            consumer,
        }
    }

    /// Recover state from the store and spawn every loop.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<JoinSet<()>> {
        let armed = self
            .arming
            .restore()
            .await
            .context("failed to restore idle timers")?;

        let sweeper = WakeSweeper::new(
            self.executions.clone(),
            self.publisher.clone(),
            self.config.interpreter.stuck_after_sec,
        );
        let requeued = sweeper
            .recover_running()
            .await
            .context("failed to re-queue running executions")?;

        let mut tasks = JoinSet::new();

        tasks.spawn(self.consumer.clone().run(self.consumers, cancel.clone()));

        let (released_tx, released_rx) = mpsc::channel(self.config.queue.capacity.max(1));
        {
            let aggregation = self.aggregation.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { aggregation.run(released_tx, cancel).await });
        }
        {
            let dispatcher = self.dispatcher.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { dispatcher.run_released(released_rx, cancel).await });
        }
        {
            let dispatcher = self.dispatcher.clone();
            let queue = self.queue.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { dispatcher.consume(queue.as_ref(), cancel).await });
        }

        let idle = IdleTimerService::new(
            self.timer.clone(),
            self.executions.clone(),
            self.publisher.clone(),
        );
        tasks.spawn(idle.run(cancel.clone()));

        let interval = Duration::from_secs(self.config.scheduler.wake_interval_sec.max(1));
        tasks.spawn(sweeper.run(interval, cancel.clone()));

        tasks.spawn(print_agent_replies(self.queue.clone(), cancel.clone()));

        tracing::info!(
            consumers = self.consumers,
            idle_timers = armed,
            requeued,
            "worker started"
        );
        Ok(tasks)
    }

    /// Apply one line of worker input.
    pub async fn handle_input(&self, input: WorkerInput) -> Result<()> {
        match input {
            WorkerInput::Trigger(trigger) => {
                self.publisher
                    .publish_trigger(&trigger)
                    .await
                    .context("failed to publish trigger")?;
            }
            WorkerInput::Inbound(event) => {
                self.publisher
                    .publish_json(INBOUND_TOPIC, &event)
                    .await
                    .context("failed to publish inbound event")?;
            }
            WorkerInput::Start {
                flow,
                subject_id,
                trigger,
                vars,
            } => {
                let result = self
                    .launcher
                    .start(&flow, &subject_id, &trigger, vars)
                    .await
                    .with_context(|| format!("failed to start flow '{flow}'"))?;
                if let StartResult::Skipped { existing } = result {
                    tracing::info!(flow = %flow, subject_id = %subject_id, existing = %existing, "start skipped");
                }
            }
            WorkerInput::Pause {
                subject_id,
                ttl_sec,
            } => {
                self.aggregation
                    .pause(&subject_id, Duration::from_secs(ttl_sec))
                    .await;
            }
            WorkerInput::Resume { subject_id } => {
                if !self.aggregation.resume(&subject_id).await {
                    tracing::debug!(subject_id = %subject_id, "resume without an active pause");
                }
            }
        }
        Ok(())
    }

    /// Read NDJSON input until EOF. Bad lines are logged and skipped.
    pub async fn read_input<R: AsyncBufRead + Unpin>(&self, reader: R) -> Result<usize> {
        let mut lines = reader.lines();
        let mut applied = 0;
        while let Some(line) = lines.next_line().await.context("failed to read input")? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let input = match serde_json::from_str::<WorkerInput>(line) {
                Ok(input) => input,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring invalid input line");
                    continue;
                }
            };
            match self.handle_input(input).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "input not applied"),
            }
        }
        Ok(applied)
    }

    /// Wait until the queue has been idle for two consecutive polls.
    /// Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut idle_polls = 0;
        while tokio::time::Instant::now() < deadline {
            if self.queue.pending_count() == 0 && self.queue.in_flight_count() == 0 {
                idle_polls += 1;
                if idle_polls >= 2 {
                    return true;
                }
            } else {
                idle_polls = 0;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        false
    }

    pub fn shutdown(&self, cancel: &CancellationToken) {
        cancel.cancel();
        self.queue.close();
    }
}

/// Write agent reply requests to stdout, one JSON object per line.
async fn print_agent_replies(queue: Arc<MemoryQueue>, cancel: CancellationToken) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = queue.receive(AGENT_REPLY_TOPIC) => received,
        };
        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "agent reply receive failed");
                break;
            }
        };
        println!("{}", String::from_utf8_lossy(&delivery.body));
        if let Err(e) = queue.ack(&delivery).await {
            tracing::warn!(delivery_tag = delivery.tag, error = %e, "failed to ack agent reply");
        }
    }
}

/// Run the worker until stdin closes (after draining) or Ctrl-C.
pub async fn handle_run(state: &AppState, consumers: Option<usize>, read_stdin: bool) -> Result<()> {
    let consumers = consumers.unwrap_or(state.config.queue.consumers);
    let worker = Worker::build(state, consumers);
    let cancel = CancellationToken::new();
    let mut tasks = worker.start(&cancel).await?;
    tracing::info!(data_dir = %state.data_dir.display(), "press Ctrl+C to stop");

    let input = async {
        if read_stdin {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            match worker.read_input(stdin).await {
                Ok(applied) => tracing::info!(applied, "input closed"),
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "input failed"),
            }
            if !worker.drain(DRAIN_TIMEOUT).await {
                tracing::warn!("queue still busy at shutdown");
            }
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = shutdown_signal() => tracing::info!("interrupt received"),
        _ = input => {}
    }

    worker.shutdown(&cancel);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "worker task panicked");
        }
    }
    tracing::info!("worker stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state_with;
    use cadence_core::flow::definition::parse_flow_yaml;
    use cadence_core::repository::execution::ExecutionRepository;
    use cadence_core::repository::flow::FlowRepository;
    use cadence_types::execution::{ExecutionStatus, FlowExecution};
    use cadence_types::message::TriggerKind;

    const SURVEY: &str = r#"
name: survey
steps:
  - id: ask
    config:
      type: wait_for_reply
      prompt: "How was it?"
  - id: thanks
    config:
      type: send_message
      text: "Got: {{ last_response }}"
"#;

    async fn worker() -> (AppState, Worker) {
        let mut config = EngineConfig::default();
        config.aggregation.aggregation_enabled = false;
        let state = test_state_with(config).await;
        state
            .flows
            .save_flow(&parse_flow_yaml(SURVEY).unwrap())
            .await
            .unwrap();
        let worker = Worker::build(&state, 2);
        (state, worker)
    }

    async fn only_execution(state: &AppState, status: ExecutionStatus) -> Vec<FlowExecution> {
        state
            .executions
            .list_executions_by_status(status)
            .await
            .unwrap()
    }

    #[test]
    fn parses_each_input_type() {
        let start: WorkerInput =
            serde_json::from_str(r#"{"type":"start","flow":"survey","subject_id":"c1"}"#).unwrap();
        assert!(matches!(start, WorkerInput::Start { ref trigger, .. } if trigger == "manual"));

        let inbound: WorkerInput =
            serde_json::from_str(r#"{"type":"inbound","subject_id":"c1","text":"hi"}"#).unwrap();
        assert!(matches!(inbound, WorkerInput::Inbound(ref e) if e.text == "hi"));

        let id = uuid::Uuid::now_v7();
        let trigger: WorkerInput = serde_json::from_str(&format!(
            r#"{{"type":"trigger","execution_id":"{id}","kind":"manual","step_index":1}}"#
        ))
        .unwrap();
        match trigger {
            WorkerInput::Trigger(t) => {
                assert_eq!(t.execution_id, id);
                assert_eq!(t.kind, TriggerKind::Manual);
                assert_eq!(t.step_index, Some(1));
                assert!(t.payload.is_empty());
            }
            other => panic!("unexpected input: {other:?}"),
        }

        let pause: WorkerInput =
            serde_json::from_str(r#"{"type":"pause","subject_id":"c1"}"#).unwrap();
        assert!(matches!(pause, WorkerInput::Pause { ttl_sec: DEFAULT_PAUSE_TTL_SEC, .. }));

        let resume: WorkerInput =
            serde_json::from_str(r#"{"type":"resume","subject_id":"c1"}"#).unwrap();
        assert!(matches!(resume, WorkerInput::Resume { ref subject_id } if subject_id == "c1"));

        assert!(serde_json::from_str::<WorkerInput>(r#"{"type":"bogus"}"#).is_err());
    }

    #[tokio::test]
    async fn start_then_reply_completes_flow() {
        let (state, worker) = worker().await;
        let cancel = CancellationToken::new();
        let mut tasks = worker.start(&cancel).await.unwrap();

        let input = br#"{"type":"start","flow":"survey","subject_id":"chat-1"}
not json
"#;
        assert_eq!(worker.read_input(&input[..]).await.unwrap(), 1);
        assert!(worker.drain(Duration::from_secs(5)).await);

        let waiting = only_execution(&state, ExecutionStatus::WaitingForEvent).await;
        assert_eq!(waiting.len(), 1);

        let reply = br#"{"type":"inbound","subject_id":"chat-1","text":"great"}"#;
        assert_eq!(worker.read_input(&reply[..]).await.unwrap(), 1);
        assert!(worker.drain(Duration::from_secs(5)).await);

        let completed = only_execution(&state, ExecutionStatus::Completed).await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].context["last_response"], "great");

        worker.shutdown(&cancel);
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn pause_and_resume_inputs_reach_aggregation() {
        let (_state, worker) = worker().await;
        let input = br#"{"type":"pause","subject_id":"chat-1","ttl_sec":600}
{"type":"resume","subject_id":"chat-2"}
"#;
        assert_eq!(worker.read_input(&input[..]).await.unwrap(), 2);

        assert!(worker.aggregation.resume("chat-1").await);
        assert!(!worker.aggregation.resume("chat-1").await);

        let again = br#"{"type":"pause","subject_id":"chat-1"}
{"type":"resume","subject_id":"chat-1"}
"#;
        assert_eq!(worker.read_input(&again[..]).await.unwrap(), 2);
        assert!(!worker.aggregation.resume("chat-1").await);
    }

    #[tokio::test]
    async fn start_requeues_running_executions() {
        let (state, worker) = worker().await;
        let flow = state.flows.get_flow_by_name("survey").await.unwrap().unwrap();
        let exec = FlowExecution::new(flow.id, "chat-9", "manual", ContextMap::new());
        state.executions.create_execution(&exec).await.unwrap();

        let cancel = CancellationToken::new();
        let mut tasks = worker.start(&cancel).await.unwrap();
        assert!(worker.drain(Duration::from_secs(5)).await);

        let stored = state.executions.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::WaitingForEvent);

        worker.shutdown(&cancel);
        while tasks.join_next().await.is_some() {}
    }
}
