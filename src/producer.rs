//! Synthetic event source feeding the input topic.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::message::{Envelope, JsonCodec};
use crate::types::{Event, PipelineConfig};

/// Shortest tick; `tokio::time::interval` rejects a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Publishes `Event { id }` once per interval with increasing ids.
///
/// A failed publish is retried with the same id on the next tick, so the
/// published sequence has no gaps.
pub struct SyntheticProducer {
    broker: Arc<dyn BrokerClient>,
    topic: String,
    interval: Duration,
    next_id: i64,
    max_events: Option<u64>,
    codec: JsonCodec,
}

impl SyntheticProducer {
    pub fn new(broker: Arc<dyn BrokerClient>, topic: impl Into<String>, interval: Duration) -> Self {
        Self {
            broker,
            topic: topic.into(),
            interval,
            next_id: 0,
            max_events: None,
            codec: JsonCodec,
        }
    }

    /// Producer publishing to the configured input topic.
    pub fn from_config(broker: Arc<dyn BrokerClient>, config: &PipelineConfig) -> Self {
        Self::new(broker, config.topics.input.clone(), config.producer.interval())
    }

    /// First id to publish.
    pub fn starting_at(mut self, id: i64) -> Self {
        self.next_id = id;
        self
    }

    /// Stop after `count` successful publishes.
    pub fn with_max_events(mut self, count: u64) -> Self {
        self.max_events = Some(count);
        self
    }

    /// Publish until cancelled or `max_events` is reached.
    ///
    /// Returns the number of events published.
    pub async fn run(mut self, shutdown: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut published = 0u64;

        info!(topic = %self.topic, interval_ms = self.interval.as_millis() as u64, "Synthetic producer started");

        loop {
            if self.max_events.is_some_and(|max| published >= max) {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let event = Event { id: self.next_id };
            let envelope = match Envelope::encode(&self.codec, &event) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(id = event.id, error = %e, "Failed to encode synthetic event");
                    break;
                }
            };

            match self.broker.publish(&self.topic, envelope).await {
                Ok(()) => {
                    debug!(id = event.id, topic = %self.topic, "Synthetic event published");
                    self.next_id += 1;
                    published += 1;
                }
                Err(e) => {
                    warn!(id = event.id, error = %e, "Failed to publish synthetic event, retrying on next tick");
                }
            }
        }

        info!(published, "Synthetic producer stopped");
        published
    }
}
