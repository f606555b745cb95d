//! Aggregation Scheduler.
//!
//! Coalesces bursts of inbound events per subject into one batch. A window
//! opens on the first buffered event and closes either when it reaches
//! `max_batch_messages` (released from `observe`) or when
//! `window_started_at + aggregation_window_sec` passes (released by the
//! scheduler loop). Windows, their deadlines and pause markers share one
//! mutex, so a cap release and a timer release cannot both take the same
//! window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cadence_types::message::InboundEvent;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::delay_queue::DelayQueue;
use super::settings::SettingsSource;

/// What `observe` did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationDecision {
    /// Held in the subject's open window.
    Buffered,
    /// The batch to process now.
    Release(Vec<InboundEvent>),
    /// Aggregation is paused for the subject; the event was dropped.
    Suppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Cap,
    Timeout,
    PassThrough,
}

/// A closed window handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasedBatch {
    pub subject_id: String,
    pub events: Vec<InboundEvent>,
    pub reason: ReleaseReason,
}

struct Window {
    events: Vec<InboundEvent>,
    started_at: Instant,
}

#[derive(Default)]
struct State {
    windows: HashMap<String, Window>,
    deadlines: DelayQueue<String>,
    paused: HashMap<String, Instant>,
}

impl State {
    fn is_paused(&mut self, subject_id: &str, now: Instant) -> bool {
        match self.paused.get(subject_id) {
            Some(until) if *until > now => true,
            Some(_) => {
                self.paused.remove(subject_id);
                false
            }
            None => false,
        }
    }

    fn close(&mut self, subject_id: &str) -> Option<Window> {
        self.deadlines.cancel(&subject_id.to_string());
        self.windows.remove(subject_id)
    }
}

pub struct AggregationScheduler {
    settings: Arc<dyn SettingsSource>,
    state: Mutex<State>,
    wake: Notify,
}

impl AggregationScheduler {
    pub fn new(settings: Arc<dyn SettingsSource>) -> Self {
        Self {
            settings,
            state: Mutex::new(State::default()),
            wake: Notify::new(),
        }
    }

    /// Whether events for the subject are windowed or passed straight through.
    pub fn aggregation_enabled(&self, subject_id: &str) -> bool {
        self.settings.settings_for(subject_id).aggregation_enabled
    }

    /// Buffer or release one inbound event for its subject.
    pub async fn observe(&self, event: InboundEvent) -> AggregationDecision {
        let settings = self.settings.settings_for(&event.subject_id);
        let now = Instant::now();
        let mut state = self.state.lock().await;

        if state.is_paused(&event.subject_id, now) {
            tracing::debug!(subject_id = %event.subject_id, "aggregation paused, event suppressed");
            return AggregationDecision::Suppressed;
        }

        if !settings.aggregation_enabled {
            return AggregationDecision::Release(vec![event]);
        }

        let subject_id = event.subject_id.clone();
        let opened = !state.windows.contains_key(&subject_id);
        if opened {
            let window = Duration::from_secs(settings.aggregation_window_sec);
            state.deadlines.schedule(subject_id.clone(), now + window);
            state.windows.insert(
                subject_id.clone(),
                Window {
                    events: Vec::new(),
                    started_at: now,
                },
            );
        }

        let buffered = match state.windows.get_mut(&subject_id) {
            Some(window) => {
                window.events.push(event);
                window.events.len()
            }
            None => 0,
        };

        if buffered >= settings.max_batch_messages {
            let events = state
                .close(&subject_id)
                .map(|w| w.events)
                .unwrap_or_default();
            tracing::debug!(subject_id = %subject_id, batch = events.len(), "aggregation cap reached");
            return AggregationDecision::Release(events);
        }

        drop(state);
        if opened {
            tracing::debug!(subject_id = %subject_id, window_sec = settings.aggregation_window_sec, "aggregation window opened");
            self.wake.notify_one();
        }
        AggregationDecision::Buffered
    }

    /// Close every window whose deadline is at or before `now`.
    pub async fn flush_expired(&self, now: Instant) -> Vec<ReleasedBatch> {
        let mut state = self.state.lock().await;
        let due = state.deadlines.pop_expired(now);
        due.into_iter()
            .filter_map(|subject_id| {
                let window = state.windows.remove(&subject_id)?;
                tracing::debug!(
                    subject_id = %subject_id,
                    batch = window.events.len(),
                    open_ms = now.saturating_duration_since(window.started_at).as_millis() as u64,
                    "aggregation window expired"
                );
                Some(ReleasedBatch {
                    subject_id,
                    events: window.events,
                    reason: ReleaseReason::Timeout,
                })
            })
            .collect()
    }

    /// Drop the subject's open window and suppress aggregation for `ttl`.
    /// Returns the number of events discarded.
    pub async fn pause(&self, subject_id: &str, ttl: Duration) -> usize {
        let mut state = self.state.lock().await;
        let dropped = state.close(subject_id).map(|w| w.events.len()).unwrap_or(0);
        state
            .paused
            .insert(subject_id.to_string(), Instant::now() + ttl);
        tracing::info!(subject_id, ttl_sec = ttl.as_secs(), dropped, "aggregation paused");
        dropped
    }

    /// Lift a pause. Returns whether one was active.
    pub async fn resume(&self, subject_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let active = state.is_paused(subject_id, now);
        state.paused.remove(subject_id);
        active
    }

    pub async fn open_windows(&self) -> usize {
        self.state.lock().await.windows.len()
    }

    pub async fn buffered(&self, subject_id: &str) -> usize {
        self.state
            .lock()
            .await
            .windows
            .get(subject_id)
            .map(|w| w.events.len())
            .unwrap_or(0)
    }

    /// Release expired windows into `tx` until cancelled or the receiver is
    /// dropped.
    pub async fn run(&self, tx: mpsc::Sender<ReleasedBatch>, cancel: CancellationToken) {
        tracing::info!("aggregation loop started");
        loop {
            let deadline = self.state.lock().await.deadlines.next_deadline();
            let sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => continue,
                _ = sleep => {
                    for batch in self.flush_expired(Instant::now()).await {
                        if tx.send(batch).await.is_err() {
                            tracing::warn!("aggregation receiver dropped");
                            return;
                        }
                    }
                }
            }
        }
        tracing::info!("aggregation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::agent::AgentSettings;

    fn scheduler(window_sec: u64, cap: usize) -> AggregationScheduler {
        AggregationScheduler::new(Arc::new(AgentSettings {
            aggregation_enabled: true,
            aggregation_window_sec: window_sec,
            max_batch_messages: cap,
            reply_if_idle_sec: None,
        }))
    }

    fn event(subject: &str, text: &str) -> InboundEvent {
        InboundEvent::text(subject, text)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_releases_full_batch_and_next_event_opens_new_window() {
        let agg = scheduler(20, 3);
        assert_eq!(agg.observe(event("s", "a")).await, AggregationDecision::Buffered);
        assert_eq!(agg.observe(event("s", "b")).await, AggregationDecision::Buffered);

        let AggregationDecision::Release(batch) = agg.observe(event("s", "c")).await else {
            panic!("expected release at cap");
        };
        let texts: Vec<_> = batch.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert_eq!(agg.open_windows().await, 0);

        assert_eq!(agg.observe(event("s", "d")).await, AggregationDecision::Buffered);
        assert_eq!(agg.buffered("s").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_law_batch_count() {
        for cap in 1..=4usize {
            for n in 1..=10usize {
                let agg = scheduler(20, cap);
                let mut sizes = Vec::new();
                for i in 0..n {
                    if let AggregationDecision::Release(batch) =
                        agg.observe(event("s", &i.to_string())).await
                    {
                        sizes.push(batch.len());
                    }
                }
                let flushed = agg
                    .flush_expired(Instant::now() + Duration::from_secs(20))
                    .await;
                sizes.extend(flushed.iter().map(|b| b.events.len()));

                assert_eq!(sizes.len(), n.div_ceil(cap), "n={n} cap={cap}");
                assert!(sizes.iter().all(|s| *s <= cap));
                assert_eq!(sizes.iter().sum::<usize>(), n);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_event_released_once_after_window() {
        let agg = Arc::new(scheduler(20, 10));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let runner = {
            let agg = agg.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { agg.run(tx, cancel).await })
        };

        let start = Instant::now();
        assert_eq!(agg.observe(event("s", "hi")).await, AggregationDecision::Buffered);

        let batch = rx.recv().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed < Duration::from_secs(21));
        assert_eq!(batch.reason, ReleaseReason::Timeout);
        assert_eq!(batch.events.len(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_not_extended_by_later_events() {
        let agg = scheduler(20, 10);
        let start = Instant::now();
        agg.observe(event("s", "a")).await;
        tokio::time::advance(Duration::from_secs(15)).await;
        agg.observe(event("s", "b")).await;

        let released = agg.flush_expired(start + Duration::from_secs(20)).await;
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].events.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_after_cap_release_finds_nothing() {
        let agg = scheduler(20, 2);
        agg.observe(event("s", "a")).await;
        assert!(matches!(
            agg.observe(event("s", "b")).await,
            AggregationDecision::Release(_)
        ));
        let released = agg
            .flush_expired(Instant::now() + Duration::from_secs(20))
            .await;
        assert!(released.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_is_pass_through() {
        let agg = AggregationScheduler::new(Arc::new(AgentSettings {
            aggregation_enabled: false,
            ..AgentSettings::default()
        }));
        let AggregationDecision::Release(batch) = agg.observe(event("s", "hi")).await else {
            panic!("expected pass-through release");
        };
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].text, "hi");
        assert_eq!(agg.open_windows().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subjects_are_independent() {
        let agg = scheduler(20, 2);
        agg.observe(event("a", "1")).await;
        agg.observe(event("b", "1")).await;
        assert_eq!(agg.open_windows().await, 2);
        assert!(matches!(
            agg.observe(event("a", "2")).await,
            AggregationDecision::Release(_)
        ));
        assert_eq!(agg.buffered("b").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_drops_window_and_suppresses_until_ttl() {
        let agg = scheduler(20, 10);
        agg.observe(event("s", "a")).await;
        agg.observe(event("s", "b")).await;

        assert_eq!(agg.pause("s", Duration::from_secs(60)).await, 2);
        assert_eq!(agg.open_windows().await, 0);
        assert_eq!(agg.observe(event("s", "c")).await, AggregationDecision::Suppressed);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(agg.observe(event("s", "d")).await, AggregationDecision::Buffered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_lifts_pause() {
        let agg = scheduler(20, 10);
        agg.pause("s", Duration::from_secs(60)).await;
        assert!(agg.resume("s").await);
        assert!(!agg.resume("s").await);
        assert_eq!(agg.observe(event("s", "a")).await, AggregationDecision::Buffered);
    }
}
