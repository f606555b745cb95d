//! Queue transport port.
//!
//! The transport is an explicit connection-manager object handed to every
//! component that talks to the broker; there is no module-level connection.
//! Consumers see exactly two terminal calls per delivery: `ack` or `reject`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cadence_types::message::{ExecutionTrigger, FLOW_EXECUTION_TOPIC};
use thiserror::Error;

/// Errors from the queue transport.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,

    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("broker error: {0}")]
    Broker(String),
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker-assigned tag identifying this delivery for ack/reject.
    pub tag: u64,
    pub topic: String,
    pub body: Vec<u8>,
    /// How many times this message was requeued before.
    pub redeliveries: u32,
}

/// Publishes raw message bodies to a topic.
pub trait QueuePublisher: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Publish without waiting for topic capacity. Used from inside consumer
    /// workers, which must not block on a topic they drain themselves.
    fn publish_nowait(
        &self,
        topic: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<(), QueueError>> + Send {
        self.publish(topic, body)
    }
}

/// Full broker connection: publish, receive, and settle deliveries.
pub trait QueueTransport: QueuePublisher {
    /// Next delivery on `topic`. `Ok(None)` once the transport is closed.
    fn receive(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<Option<Delivery>, QueueError>> + Send;

    fn ack(&self, delivery: &Delivery) -> impl Future<Output = Result<(), QueueError>> + Send;

    fn reject(
        &self,
        delivery: &Delivery,
        requeue: bool,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;
}

// ---------------------------------------------------------------------------
// Boxed publisher
// ---------------------------------------------------------------------------

/// Object-safe version of [`QueuePublisher`] with boxed futures.
pub trait QueuePublisherDyn: Send + Sync {
    fn publish_boxed<'a>(
        &'a self,
        topic: &'a str,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>>;

    fn publish_nowait_boxed<'a>(
        &'a self,
        topic: &'a str,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>>;
}

impl<T: QueuePublisher> QueuePublisherDyn for T {
    fn publish_boxed<'a>(
        &'a self,
        topic: &'a str,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>> {
        Box::pin(self.publish(topic, body))
    }

    fn publish_nowait_boxed<'a>(
        &'a self,
        topic: &'a str,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>> {
        Box::pin(self.publish_nowait(topic, body))
    }
}

/// Type-erased, cheaply cloneable publisher shared by the interpreter,
/// timers, and the launcher.
#[derive(Clone)]
pub struct BoxQueuePublisher {
    inner: Arc<dyn QueuePublisherDyn>,
}

impl BoxQueuePublisher {
    pub fn new<T: QueuePublisher + 'static>(publisher: Arc<T>) -> Self {
        Self { inner: publisher }
    }

    pub async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), QueueError> {
        self.inner.publish_boxed(topic, body).await
    }

    /// Serialize and publish an execution trigger on the flow execution queue.
    pub async fn publish_trigger(&self, trigger: &ExecutionTrigger) -> Result<(), QueueError> {
        let body =
            serde_json::to_vec(trigger).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.publish(FLOW_EXECUTION_TOPIC, body).await
    }

    /// Like [`publish_trigger`](Self::publish_trigger), without waiting for
    /// capacity on the flow execution queue.
    pub async fn publish_trigger_nowait(
        &self,
        trigger: &ExecutionTrigger,
    ) -> Result<(), QueueError> {
        let body =
            serde_json::to_vec(trigger).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.inner
            .publish_nowait_boxed(FLOW_EXECUTION_TOPIC, body)
            .await
    }

    pub async fn publish_json<S: serde::Serialize + Sync>(
        &self,
        topic: &str,
        value: &S,
    ) -> Result<(), QueueError> {
        let body =
            serde_json::to_vec(value).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.publish(topic, body).await
    }
}
