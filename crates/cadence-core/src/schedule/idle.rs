//! Idle-Trigger Timer.
//!
//! One live deadline per subject, held in a single delay queue polled by one
//! scheduler loop. Rescheduling a subject replaces its previous deadline; no
//! cancellation handshake is needed. When a deadline passes, the loop looks up
//! the subject's executions that are still waiting for a reply and publishes
//! an `idle_timeout` trigger for each onto the flow execution queue. The
//! interpreter's status guard turns triggers that lost a race with a real
//! reply into no-ops.
//!
//! The timer is a cache over the Execution Store: `restore` rebuilds it from
//! `updated_at + reply_if_idle_sec` after a restart.

use std::sync::Arc;
use std::time::Duration;

use cadence_types::error::RepositoryError;
use cadence_types::execution::{ExecutionStatus, FlowExecution};
use cadence_types::flow::WAITING_FOR_RESPONSE_VAR;
use cadence_types::message::{ExecutionTrigger, TriggerKind};
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::queue::transport::BoxQueuePublisher;
use crate::repository::execution::ExecutionRepository;

use super::delay_queue::DelayQueue;
use super::settings::SettingsSource;

/// Whether a waiting execution is parked on a subject reply (as opposed to a
/// plain delay).
pub fn awaits_reply(execution: &FlowExecution) -> bool {
    execution.status == ExecutionStatus::WaitingForEvent
        && execution
            .context
            .get(WAITING_FOR_RESPONSE_VAR)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// IdleTimer
// ---------------------------------------------------------------------------

/// Per-subject idle deadlines.
#[derive(Default)]
pub struct IdleTimer {
    timers: Mutex<DelayQueue<String>>,
    wake: Notify,
}

impl IdleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the subject's timer at `fire_at`, replacing any earlier one.
    pub async fn reschedule(&self, subject_id: &str, fire_at: Instant) {
        self.timers
            .lock()
            .await
            .schedule(subject_id.to_string(), fire_at);
        self.wake.notify_one();
    }

    /// Disarm the subject's timer. Returns whether one was armed.
    pub async fn cancel(&self, subject_id: &str) -> bool {
        self.timers.lock().await.cancel(&subject_id.to_string())
    }

    pub async fn pending_count(&self) -> usize {
        self.timers.lock().await.len()
    }

    pub async fn deadline(&self, subject_id: &str) -> Option<Instant> {
        self.timers.lock().await.deadline(&subject_id.to_string())
    }

    /// Subjects whose deadline is at or before `now`; they are disarmed.
    pub async fn pop_due(&self, now: Instant) -> Vec<String> {
        self.timers.lock().await.pop_expired(now)
    }

    async fn next_deadline(&self) -> Option<Instant> {
        self.timers.lock().await.next_deadline()
    }

    /// Sleep until the next deadline, a reschedule, or cancellation.
    /// Returns the due subjects, or `None` when cancelled.
    async fn wait_due(&self, cancel: &CancellationToken) -> Option<Vec<String>> {
        loop {
            let deadline = self.next_deadline().await;
            let sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.wake.notified() => continue,
                _ = sleep => {
                    let due = self.pop_due(Instant::now()).await;
                    if !due.is_empty() {
                        return Some(due);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Arming from the Execution Store
// ---------------------------------------------------------------------------

/// Decides whether a subject's idle timer should be armed.
///
/// Armed to `now + reply_if_idle_sec` when the feature is enabled for the
/// subject and one of its executions waits for a reply; disarmed otherwise.
pub struct IdleArming<E> {
    timer: Arc<IdleTimer>,
    executions: Arc<E>,
    settings: Arc<dyn SettingsSource>,
}

impl<E> Clone for IdleArming<E> {
    fn clone(&self) -> Self {
        Self {
            timer: self.timer.clone(),
            executions: self.executions.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<E: ExecutionRepository> IdleArming<E> {
    pub fn new(
        timer: Arc<IdleTimer>,
        executions: Arc<E>,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self {
            timer,
            executions,
            settings,
        }
    }

    pub fn timer(&self) -> &Arc<IdleTimer> {
        &self.timer
    }

    /// Re-arm or disarm the subject's timer. Returns whether it is armed.
    pub async fn refresh(&self, subject_id: &str) -> Result<bool, RepositoryError> {
        let Some(idle_sec) = self.settings.settings_for(subject_id).reply_if_idle_sec else {
            self.timer.cancel(subject_id).await;
            return Ok(false);
        };

        let waiting = self
            .executions
            .list_subject_executions(subject_id, ExecutionStatus::WaitingForEvent)
            .await?;
        if waiting.iter().any(awaits_reply) {
            self.timer
                .reschedule(subject_id, Instant::now() + Duration::from_secs(idle_sec))
                .await;
            tracing::debug!(subject_id, idle_sec, "idle timer armed");
            Ok(true)
        } else {
            self.timer.cancel(subject_id).await;
            Ok(false)
        }
    }

    /// Rebuild deadlines from waiting executions after a restart.
    /// Returns the number of subjects armed.
    pub async fn restore(&self) -> Result<usize, RepositoryError> {
        let waiting = self
            .executions
            .list_executions_by_status(ExecutionStatus::WaitingForEvent)
            .await?;
        let now = Utc::now();
        let mut armed = 0;

        // Oldest first, so the latest update of a subject wins.
        for execution in waiting.iter().filter(|e| awaits_reply(e)) {
            let Some(idle_sec) = self
                .settings
                .settings_for(&execution.subject_id)
                .reply_if_idle_sec
            else {
                continue;
            };
            let fire_at = execution.updated_at + chrono::Duration::seconds(idle_sec as i64);
            let remaining = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
            if self.timer.deadline(&execution.subject_id).await.is_none() {
                armed += 1;
            }
            self.timer
                .reschedule(&execution.subject_id, Instant::now() + remaining)
                .await;
        }

        tracing::info!(armed, "idle timers restored");
        Ok(armed)
    }
}

// ---------------------------------------------------------------------------
// Scheduler loop
// ---------------------------------------------------------------------------

/// Dedicated loop turning expired idle deadlines into queue triggers.
pub struct IdleTimerService<E> {
    timer: Arc<IdleTimer>,
    executions: Arc<E>,
    publisher: BoxQueuePublisher,
}

impl<E: ExecutionRepository + 'static> IdleTimerService<E> {
    pub fn new(timer: Arc<IdleTimer>, executions: Arc<E>, publisher: BoxQueuePublisher) -> Self {
        Self {
            timer,
            executions,
            publisher,
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("idle timer loop started");
        while let Some(subjects) = self.timer.wait_due(&cancel).await {
            for subject_id in subjects {
                if let Err(e) = self.fire(&subject_id).await {
                    tracing::warn!(subject_id = %subject_id, error = %e, "idle trigger failed");
                }
            }
        }
        tracing::info!("idle timer loop stopped");
    }

    /// Publish an `idle_timeout` trigger for every execution of the subject
    /// still waiting for a reply. Returns how many were published.
    pub async fn fire(&self, subject_id: &str) -> Result<usize, RepositoryError> {
        let waiting = self
            .executions
            .list_subject_executions(subject_id, ExecutionStatus::WaitingForEvent)
            .await?;

        let mut published = 0;
        for execution in waiting.iter().filter(|e| awaits_reply(e)) {
            let mut trigger = ExecutionTrigger::new(execution.id, TriggerKind::IdleTimeout);
            if let Some(index) = execution.current_step.index() {
                trigger = trigger.at_step(index);
            }
            match self.publisher.publish_trigger(&trigger).await {
                Ok(()) => published += 1,
                Err(e) => {
                    tracing::warn!(execution_id = %execution.id, error = %e, "failed to publish idle trigger")
                }
            }
        }
        tracing::debug!(subject_id, published, "idle timer fired");
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryQueue;
    use crate::queue::transport::QueueTransport;
    use crate::repository::memory::MemoryStore;
    use cadence_types::agent::AgentSettings;
    use cadence_types::execution::ContextMap;
    use cadence_types::flow::StepCursor;
    use cadence_types::message::FLOW_EXECUTION_TOPIC;
    use serde_json::json;
    use uuid::Uuid;

    fn waiting_execution(subject: &str) -> FlowExecution {
        let mut exec = FlowExecution::new(Uuid::now_v7(), subject, "manual", ContextMap::new());
        exec.status = ExecutionStatus::WaitingForEvent;
        exec.current_step = StepCursor::At(1);
        exec.context
            .insert(WAITING_FOR_RESPONSE_VAR.into(), json!(true));
        exec
    }

    fn idle_settings(secs: Option<u64>) -> Arc<dyn SettingsSource> {
        Arc::new(AgentSettings {
            reply_if_idle_sec: secs,
            ..AgentSettings::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_keeps_only_latest() {
        let timer = IdleTimer::new();
        let now = Instant::now();
        timer.reschedule("s", now + Duration::from_secs(10)).await;
        timer.reschedule("s", now + Duration::from_secs(30)).await;

        assert_eq!(timer.pending_count().await, 1);
        assert_eq!(
            timer.deadline("s").await,
            Some(now + Duration::from_secs(30))
        );
        assert!(timer.pop_due(now + Duration::from_secs(10)).await.is_empty());
        assert_eq!(timer.pop_due(now + Duration::from_secs(30)).await, vec!["s"]);
    }

    #[tokio::test]
    async fn test_refresh_arms_only_when_waiting_for_reply() {
        let store = Arc::new(MemoryStore::new());
        let timer = Arc::new(IdleTimer::new());
        let arming = IdleArming::new(timer.clone(), store.clone(), idle_settings(Some(30)));

        assert!(!arming.refresh("s").await.unwrap());
        assert_eq!(timer.pending_count().await, 0);

        store.create_execution(&waiting_execution("s")).await.unwrap();
        assert!(arming.refresh("s").await.unwrap());
        assert_eq!(timer.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_refresh_disabled_setting_cancels() {
        let store = Arc::new(MemoryStore::new());
        store.create_execution(&waiting_execution("s")).await.unwrap();
        let timer = Arc::new(IdleTimer::new());
        timer.reschedule("s", Instant::now()).await;

        let arming = IdleArming::new(timer.clone(), store, idle_settings(None));
        assert!(!arming.refresh("s").await.unwrap());
        assert_eq!(timer.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_restore_rebuilds_from_store() {
        let store = Arc::new(MemoryStore::new());
        store.create_execution(&waiting_execution("a")).await.unwrap();
        store.create_execution(&waiting_execution("a")).await.unwrap();
        store.create_execution(&waiting_execution("b")).await.unwrap();
        let mut delay_only = waiting_execution("c");
        delay_only.context.clear();
        store.create_execution(&delay_only).await.unwrap();

        let timer = Arc::new(IdleTimer::new());
        let arming = IdleArming::new(timer.clone(), store, idle_settings(Some(30)));
        assert_eq!(arming.restore().await.unwrap(), 2);
        assert_eq!(timer.pending_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_publishes_idle_trigger_at_deadline() {
        let store = Arc::new(MemoryStore::new());
        let exec = waiting_execution("s");
        store.create_execution(&exec).await.unwrap();
        let queue = Arc::new(MemoryQueue::new(16));
        let timer = Arc::new(IdleTimer::new());

        let cancel = CancellationToken::new();
        let service = IdleTimerService::new(
            timer.clone(),
            store.clone(),
            BoxQueuePublisher::new(queue.clone()),
        );
        let handle = tokio::spawn(service.run(cancel.clone()));

        let start = Instant::now();
        timer.reschedule("s", start + Duration::from_secs(30)).await;

        let delivery = queue.receive(FLOW_EXECUTION_TOPIC).await.unwrap().unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));

        let trigger: ExecutionTrigger = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(trigger.execution_id, exec.id);
        assert_eq!(trigger.kind, TriggerKind::IdleTimeout);
        assert_eq!(trigger.step_index, Some(1));

        cancel.cancel();
        handle.await.unwrap();
    }
}
