//! In-process queue transport backed by bounded tokio mpsc channels.
//!
//! Work-queue semantics: each message goes to exactly one receiver. Bounded
//! channels give publishers natural backpressure. Requeued deliveries and
//! `publish_nowait` messages go through a separate unbounded lane that
//! receivers drain first, so a consumer worker never blocks on a full topic it
//! is itself responsible for draining. The most recent rejected-without-requeue
//! deliveries are kept as dead letters for inspection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::transport::{Delivery, QueueError, QueuePublisher, QueueTransport};

/// Dead letters kept before the oldest are dropped.
pub const DEAD_LETTER_LIMIT: usize = 1024;

struct Envelope {
    body: Vec<u8>,
    redeliveries: u32,
}

struct Receivers {
    main: mpsc::Receiver<Envelope>,
    redelivery: mpsc::UnboundedReceiver<Envelope>,
}

struct Topic {
    tx: mpsc::Sender<Envelope>,
    redelivery_tx: mpsc::UnboundedSender<Envelope>,
    /// Messages sitting in the redelivery lane.
    redelivery_len: AtomicUsize,
    rx: Mutex<Receivers>,
}

impl Topic {
    fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity() + self.redelivery_len.load(Ordering::SeqCst)
    }
}

/// In-memory implementation of [`QueueTransport`].
pub struct MemoryQueue {
    capacity: usize,
    topics: DashMap<String, Arc<Topic>>,
    in_flight: DashMap<u64, Delivery>,
    next_tag: AtomicU64,
    acked: AtomicU64,
    dead_letters: Mutex<VecDeque<Delivery>>,
    closed: CancellationToken,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: DashMap::new(),
            in_flight: DashMap::new(),
            next_tag: AtomicU64::new(1),
            acked: AtomicU64::new(0),
            dead_letters: Mutex::new(VecDeque::new()),
            closed: CancellationToken::new(),
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, main) = mpsc::channel(self.capacity);
                let (redelivery_tx, redelivery) = mpsc::unbounded_channel();
                Arc::new(Topic {
                    tx,
                    redelivery_tx,
                    redelivery_len: AtomicUsize::new(0),
                    rx: Mutex::new(Receivers { main, redelivery }),
                })
            })
            .clone()
    }

    fn deliver(&self, topic: &str, envelope: Envelope) -> Delivery {
        let delivery = Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
            topic: topic.to_string(),
            body: envelope.body,
            redeliveries: envelope.redeliveries,
        };
        self.in_flight.insert(delivery.tag, delivery.clone());
        delivery
    }

    async fn enqueue(&self, topic: &str, envelope: Envelope) -> Result<(), QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }
        self.topic(topic)
            .tx
            .send(envelope)
            .await
            .map_err(|_| QueueError::Closed)
    }

    /// Enqueue on the unbounded lane; never waits for capacity.
    fn enqueue_redelivery(&self, topic: &str, envelope: Envelope) -> Result<(), QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }
        let topic_handle = self.topic(topic);
        topic_handle.redelivery_len.fetch_add(1, Ordering::SeqCst);
        topic_handle.redelivery_tx.send(envelope).map_err(|_| {
            topic_handle.redelivery_len.fetch_sub(1, Ordering::SeqCst);
            QueueError::Closed
        })
    }

    /// Next delivery if one is already waiting.
    pub async fn try_receive(&self, topic: &str) -> Option<Delivery> {
        let topic_handle = self.topic(topic);
        let mut rx = topic_handle.rx.lock().await;
        let envelope = match rx.redelivery.try_recv() {
            Ok(envelope) => {
                topic_handle.redelivery_len.fetch_sub(1, Ordering::SeqCst);
                envelope
            }
            Err(_) => rx.main.try_recv().ok()?,
        };
        drop(rx);
        Some(self.deliver(topic, envelope))
    }

    /// Stop handing out deliveries; pending `receive` calls return `None`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn acked_count(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Messages published but not yet received, across all topics.
    pub fn pending_count(&self) -> usize {
        self.topics.iter().map(|t| t.pending()).sum()
    }

    /// The retained dead letters, oldest first.
    pub async fn dead_letters(&self) -> Vec<Delivery> {
        self.dead_letters.lock().await.iter().cloned().collect()
    }

    /// Remove and return the retained dead letters.
    pub async fn take_dead_letters(&self) -> Vec<Delivery> {
        self.dead_letters.lock().await.drain(..).collect()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl QueuePublisher for MemoryQueue {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), QueueError> {
        self.enqueue(
            topic,
            Envelope {
                body,
                redeliveries: 0,
            },
        )
        .await
    }

    async fn publish_nowait(&self, topic: &str, body: Vec<u8>) -> Result<(), QueueError> {
        self.enqueue_redelivery(
            topic,
            Envelope {
                body,
                redeliveries: 0,
            },
        )
    }
}

impl QueueTransport for MemoryQueue {
    async fn receive(&self, topic: &str) -> Result<Option<Delivery>, QueueError> {
        let topic_handle = self.topic(topic);
        let mut rx = tokio::select! {
            _ = self.closed.cancelled() => return Ok(None),
            rx = topic_handle.rx.lock() => rx,
        };
        let Receivers { main, redelivery } = &mut *rx;
        let envelope = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Ok(None),
            envelope = redelivery.recv() => {
                if envelope.is_some() {
                    topic_handle.redelivery_len.fetch_sub(1, Ordering::SeqCst);
                }
                envelope
            }
            envelope = main.recv() => envelope,
        };
        drop(rx);
        Ok(envelope.map(|e| self.deliver(topic, e)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.in_flight
            .remove(&delivery.tag)
            .ok_or(QueueError::UnknownDelivery(delivery.tag))?;
        self.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let (_, delivery) = self
            .in_flight
            .remove(&delivery.tag)
            .ok_or(QueueError::UnknownDelivery(delivery.tag))?;
        if requeue {
            let topic = delivery.topic.clone();
            self.enqueue_redelivery(
                &topic,
                Envelope {
                    body: delivery.body,
                    redeliveries: delivery.redeliveries + 1,
                },
            )
        } else {
            tracing::warn!(
                delivery_tag = delivery.tag,
                topic = %delivery.topic,
                "delivery rejected without requeue"
            );
            let mut dead = self.dead_letters.lock().await;
            if dead.len() == DEAD_LETTER_LIMIT {
                dead.pop_front();
            }
            dead.push_back(delivery);
            Ok(())
        }
    }
}
