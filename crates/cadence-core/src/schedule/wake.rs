//! Periodic sweep for durable suspensions and stalled runs.
//!
//! Delay and reply-timeout steps persist a `resume_at`; the sweeper turns the
//! ones that have passed into `delay_elapsed` triggers. Executions left
//! `RUNNING` longer than `stuck_after_sec` (a worker died mid-advance) get a
//! plain `step` trigger. Both carry the stored cursor as `step_index`, so a
//! sweep racing a live trigger is absorbed by the interpreter's guard.

use std::sync::Arc;
use std::time::Duration;

use cadence_types::error::RepositoryError;
use cadence_types::execution::{ExecutionStatus, FlowExecution};
use cadence_types::message::{ExecutionTrigger, TriggerKind};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::queue::transport::BoxQueuePublisher;
use crate::repository::execution::ExecutionRepository;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub due: usize,
    pub stalled: usize,
}

pub struct WakeSweeper<E> {
    executions: Arc<E>,
    publisher: BoxQueuePublisher,
    stuck_after: chrono::Duration,
}

impl<E: ExecutionRepository + 'static> WakeSweeper<E> {
    pub fn new(executions: Arc<E>, publisher: BoxQueuePublisher, stuck_after_sec: u64) -> Self {
        Self {
            executions,
            publisher,
            stuck_after: chrono::Duration::seconds(stuck_after_sec as i64),
        }
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, RepositoryError> {
        let due = self.executions.list_due_executions(now).await?;
        let stalled = self
            .executions
            .list_stalled_executions(now - self.stuck_after)
            .await?;

        let report = SweepReport {
            due: self.publish_all(&due, TriggerKind::DelayElapsed).await,
            stalled: self.publish_all(&stalled, TriggerKind::Step).await,
        };
        if report != SweepReport::default() {
            tracing::info!(due = report.due, stalled = report.stalled, "wake sweep published triggers");
        }
        Ok(report)
    }

    /// Publish a `step` trigger for every `RUNNING` execution regardless of
    /// age. Used at worker start-up, when an in-process queue has lost
    /// whatever was in flight.
    pub async fn recover_running(&self) -> Result<usize, RepositoryError> {
        let running = self
            .executions
            .list_executions_by_status(ExecutionStatus::Running)
            .await?;
        let published = self.publish_all(&running, TriggerKind::Step).await;
        if published > 0 {
            tracing::info!(count = published, "re-queued running executions");
        }
        Ok(published)
    }

    async fn publish_all(&self, executions: &[FlowExecution], kind: TriggerKind) -> usize {
        let mut published = 0;
        for execution in executions {
            let mut trigger = ExecutionTrigger::new(execution.id, kind);
            if let Some(index) = execution.current_step.index() {
                trigger = trigger.at_step(index);
            }
            match self.publisher.publish_trigger(&trigger).await {
                Ok(()) => published += 1,
                Err(e) => {
                    tracing::warn!(execution_id = %execution.id, error = %e, "failed to publish wake trigger")
                }
            }
        }
        published
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_sec = interval.as_secs(), "wake sweeper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        tracing::warn!(error = %e, "wake sweep failed");
                    }
                }
            }
        }
        tracing::info!("wake sweeper stopped");
    }
}
