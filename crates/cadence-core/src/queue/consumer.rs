//! Queue Consumer.
//!
//! A pool of workers, each settling one delivery at a time with exactly one
//! terminal call: `ack` or `reject`. Nothing raised while advancing an
//! execution escapes a worker; every outcome maps to a disposition.
//!
//! | Outcome                         | Disposition                                   |
//! |---------------------------------|-----------------------------------------------|
//! | success / terminal / stale      | ack                                           |
//! | malformed body                  | ack, interpreter not invoked                  |
//! | execution not found             | ack                                           |
//! | step failure                    | reject; requeue only under `requeue` policy   |
//! | lock contention / store failure | requeue while below `max_redeliveries`        |

use std::sync::Arc;

use cadence_types::config::{FailedStepPolicy, QueueConfig};
use cadence_types::message::FLOW_EXECUTION_TOPIC;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::flow::interpreter::{AdvanceError, ErrorCategory, ExecutionAdvancer, ExecutionOutcome};

use super::message::decode_trigger;
use super::transport::{Delivery, QueueError, QueueTransport};

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

/// Map an advance result to a disposition under `policy`.
pub fn disposition(
    result: &Result<ExecutionOutcome, AdvanceError>,
    redeliveries: u32,
    policy: &QueueConfig,
) -> Disposition {
    let Err(err) = result else {
        return Disposition::Ack;
    };
    let below_bound = redeliveries < policy.max_redeliveries;
    match err.category() {
        ErrorCategory::Malformed | ErrorCategory::NotFound => Disposition::Ack,
        ErrorCategory::Step => Disposition::Reject {
            requeue: policy.failed_step_policy == FailedStepPolicy::Requeue && below_bound,
        },
        ErrorCategory::LockContention | ErrorCategory::Infrastructure => Disposition::Reject {
            requeue: below_bound,
        },
    }
}

pub struct QueueConsumer<T, A> {
    transport: Arc<T>,
    advancer: Arc<A>,
    topic: String,
    policy: QueueConfig,
}

impl<T, A> QueueConsumer<T, A>
where
    T: QueueTransport + 'static,
    A: ExecutionAdvancer + 'static,
{
    /// Consumer of the flow execution topic.
    pub fn new(transport: Arc<T>, advancer: Arc<A>, policy: QueueConfig) -> Self {
        Self {
            transport,
            advancer,
            topic: FLOW_EXECUTION_TOPIC.to_string(),
            policy,
        }
    }

    /// Decide what to do with one delivery. Never fails.
    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        let trigger = match decode_trigger(&delivery.body) {
            Ok(trigger) => trigger,
            Err(e) => {
                tracing::warn!(delivery_tag = delivery.tag, error = %e, "discarding malformed message");
                return Disposition::Ack;
            }
        };

        let result = self.advancer.advance_trigger(&trigger).await;
        let disposition = disposition(&result, delivery.redeliveries, &self.policy);

        match &result {
            Ok(outcome) => {
                tracing::debug!(
                    delivery_tag = delivery.tag,
                    execution_id = %trigger.execution_id,
                    ?outcome,
                    "trigger processed"
                );
            }
            Err(AdvanceError::NotFound(id)) => {
                tracing::info!(delivery_tag = delivery.tag, execution_id = %id, "stale reference, execution not found");
            }
            Err(e) => {
                tracing::warn!(
                    delivery_tag = delivery.tag,
                    execution_id = %trigger.execution_id,
                    category = ?e.category(),
                    redeliveries = delivery.redeliveries,
                    ?disposition,
                    error = %e,
                    "trigger not processed"
                );
            }
        }
        disposition
    }

    /// Handle and settle one delivery.
    pub async fn process(&self, delivery: Delivery) -> Result<Disposition, QueueError> {
        let disposition = self.handle(&delivery).await;
        match disposition {
            Disposition::Ack => self.transport.ack(&delivery).await?,
            Disposition::Reject { requeue } => self.transport.reject(&delivery, requeue).await?,
        }
        Ok(disposition)
    }

    async fn worker(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        tracing::debug!(worker, topic = %self.topic, "consumer worker started");
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.transport.receive(&self.topic) => received,
            };
            match delivery {
                Ok(Some(delivery)) => {
                    let tag = delivery.tag;
                    if let Err(e) = self.process(delivery).await {
                        tracing::error!(worker, delivery_tag = tag, error = %e, "failed to settle delivery");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(worker, error = %e, "queue receive failed");
                    break;
                }
            }
        }
        tracing::debug!(worker, "consumer worker stopped");
    }

    /// Run `workers` consumer tasks until cancelled or the transport closes.
    /// A worker that panics is replaced.
    pub async fn run(self: Arc<Self>, workers: usize, cancel: CancellationToken) {
        let workers = workers.max(1);
        let mut set = JoinSet::new();
        for worker in 0..workers {
            set.spawn(self.clone().worker(worker, cancel.clone()));
        }
        tracing::info!(workers, topic = %self.topic, "queue consumers running");

        let mut next_worker = workers;
        while let Some(joined) = set.join_next().await {
            match joined {
                Err(e) if e.is_panic() && !cancel.is_cancelled() => {
                    tracing::error!(error = %e, worker = next_worker, "consumer worker panicked, respawning");
                    set.spawn(self.clone().worker(next_worker, cancel.clone()));
                    next_worker += 1;
                }
                Err(e) => tracing::error!(error = %e, "consumer worker ended abnormally"),
                Ok(()) => {}
            }
        }
    }
}
