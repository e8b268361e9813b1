use std::sync::Arc;

use tracing::warn;

use super::Middleware;
use crate::broker::BrokerClient;
use crate::error::HandlerError;
use crate::message::{metadata_keys, Envelope};
use crate::router::{HandlerFunc, HandlerFuture};

type PoisonFilter = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

/// Parks envelopes that keep failing on a poison topic.
///
/// When the wrapped chain fails on delivery attempt `max_attempts` or later,
/// the original input is published to the poison topic with the failure
/// recorded in metadata and the invocation reports success, so the input is
/// acked. Earlier attempts return the error unchanged. If the poison publish
/// itself fails, that error is returned and the input is nacked.
#[derive(Clone)]
pub struct PoisonQueue {
    broker: Arc<dyn BrokerClient>,
    topic: String,
    max_attempts: u32,
    filter: Option<PoisonFilter>,
}

impl PoisonQueue {
    pub fn new(broker: Arc<dyn BrokerClient>, topic: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            broker,
            topic: topic.into(),
            max_attempts: max_attempts.max(1),
            filter: None,
        }
    }

    /// Only poison failures accepted by `filter`; others keep being nacked.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&HandlerError) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    fn should_poison(&self, attempt: u32, error: &HandlerError) -> bool {
        attempt >= self.max_attempts && self.filter.as_ref().map_or(true, |filter| filter(error))
    }

    fn poisoned(original: Envelope, error: &HandlerError) -> Envelope {
        let source_topic = original
            .metadata(metadata_keys::RECEIVED_TOPIC)
            .unwrap_or_default()
            .to_string();
        let handler = original
            .metadata(metadata_keys::HANDLER_NAME)
            .unwrap_or_default()
            .to_string();

        original
            .with_metadata(metadata_keys::POISON_REASON, error.to_string())
            .with_metadata(metadata_keys::POISON_SOURCE_TOPIC, source_topic)
            .with_metadata(metadata_keys::POISON_HANDLER, handler)
    }
}

impl Middleware for PoisonQueue {
    fn wrap(&self, next: HandlerFunc) -> HandlerFunc {
        let queue = Arc::new(self.clone());
        Arc::new(move |envelope: Envelope| -> HandlerFuture {
            let next = Arc::clone(&next);
            let queue = Arc::clone(&queue);
            Box::pin(async move {
                let original = envelope.clone();
                let error = match next(envelope).await {
                    Ok(outputs) => return Ok(outputs),
                    Err(error) => error,
                };

                let attempt = original.delivery_attempt();
                if !queue.should_poison(attempt, &error) {
                    return Err(error);
                }

                let id = original.id().to_string();
                queue
                    .broker
                    .publish(&queue.topic, Self::poisoned(original, &error))
                    .await?;

                warn!(
                    id = %id,
                    attempt,
                    poison_topic = %queue.topic,
                    kind = error.kind(),
                    error = %error,
                    "Envelope moved to poison queue"
                );
                Ok(Vec::new())
            })
        })
    }
}
