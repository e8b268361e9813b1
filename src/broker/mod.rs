//! # Broker clients
//!
//! The capability boundary between the router and the transport.
//!
//! ## Contract
//! - `publish` is at-least-once: a caller may retry a failed publish, which
//!   can produce duplicates.
//! - `subscribe` hands out a lazy stream of deliveries. Consumers sharing a
//!   consumer group split partitions so that each partition is owned by at
//!   most one of them at a time. Order holds within a partition only.
//! - Every delivery carries an `AckHandle`. `ack` commits progress, `nack`
//!   makes the envelope eligible for redelivery. Dropping an unresolved
//!   handle behaves like `nack`.
//!
//! ## Implementations
//! - `InMemoryBroker` for tests and local runs
//! - `KafkaBroker` (feature `kafka`) backed by librdkafka

mod memory;
mod partitioner;

#[cfg(feature = "kafka")]
mod kafka;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::debug;

use crate::error::TransportError;
use crate::message::Envelope;

pub use memory::InMemoryBroker;
pub use partitioner::ConsistentHashPartitioner;

#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;

/// A lazy, non-restartable stream of deliveries.
pub type Subscription = BoxStream<'static, Delivery>;

/// Transport capability consumed by the router, the producer and the API.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish an envelope to `topic`.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Join `consumer_group` on `topic` and stream its deliveries.
    async fn subscribe(
        &self,
        topic: &str,
        consumer_group: &str,
    ) -> Result<Subscription, TransportError>;

    /// Release connections. Open subscriptions end afterwards.
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Broker-specific acknowledgement of one delivery.
#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;
    async fn nack(self: Box<Self>) -> Result<(), TransportError>;
}

/// Resolves one delivery exactly once.
pub struct AckHandle {
    inner: Box<dyn Acknowledger>,
}

impl AckHandle {
    pub fn new(inner: impl Acknowledger + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Commit the delivery.
    pub async fn ack(self) -> Result<(), TransportError> {
        self.inner.ack().await
    }

    /// Return the delivery for redelivery.
    pub async fn nack(self) -> Result<(), TransportError> {
        self.inner.nack().await
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle").finish_non_exhaustive()
    }
}

/// An envelope received from a subscription.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    pub ack: AckHandle,
}

impl Delivery {
    pub fn new(envelope: Envelope, ack: AckHandle) -> Self {
        Self { envelope, ack }
    }
}

/// Wrap raw bytes in a fresh envelope and publish them.
///
/// Returns the new envelope id. Failures come back as `TransportError`
/// so callers can retry.
pub async fn publish_raw(
    broker: &dyn BrokerClient,
    topic: &str,
    payload: impl Into<Vec<u8>>,
) -> Result<String, TransportError> {
    let envelope = Envelope::new(payload);
    let id = envelope.id().to_string();
    broker.publish(topic, envelope).await?;
    debug!(topic = %topic, id = %id, "Raw payload published");
    Ok(id)
}
