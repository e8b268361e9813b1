//! Handler functions, registrations and the per-handler consumption loop.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, Delivery, Subscription};
use crate::error::{HandlerError, TransportError};
use crate::message::{metadata_keys, Codec, Envelope};
use crate::middleware::{invoke_guarded, Middleware};

/// Future returned by a handler invocation.
pub type HandlerFuture = BoxFuture<'static, Result<Vec<Envelope>, HandlerError>>;

/// A processing function over envelopes. Middleware wraps these.
pub type HandlerFunc = Arc<dyn Fn(Envelope) -> HandlerFuture + Send + Sync>;

/// Build a `HandlerFunc` from an async closure over envelopes.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFunc
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Envelope>, HandlerError>> + Send + 'static,
{
    Arc::new(move |envelope: Envelope| -> HandlerFuture { Box::pin(f(envelope)) })
}

/// Build a `HandlerFunc` from a function over decoded payloads.
///
/// The input payload is decoded with `codec`; a decode failure becomes
/// `HandlerError::Decode` and goes through the middleware chain like any
/// other failure. Every returned value is encoded into a fresh envelope.
pub fn typed_handler<C, In, Out, F, Fut>(codec: C, f: F) -> HandlerFunc
where
    C: Codec,
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<Out>>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |envelope: Envelope| -> HandlerFuture {
        let codec = codec.clone();
        let f = Arc::clone(&f);
        Box::pin(async move {
            let input: In = codec.decode(&envelope.payload)?;
            let outputs = f(input).await.map_err(HandlerError::Processing)?;
            outputs
                .iter()
                .map(|output| Envelope::encode(&codec, output).map_err(HandlerError::from))
                .collect::<Result<Vec<_>, HandlerError>>()
        })
    })
}

/// Where a handler reads from and writes to.
#[derive(Clone)]
pub struct HandlerRegistration {
    name: String,
    input_topic: String,
    consumer_group: String,
    output_topic: Option<String>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl HandlerRegistration {
    /// A handler publishing its outputs to `output_topic`.
    ///
    /// The consumer group defaults to the handler name.
    pub fn new(
        name: impl Into<String>,
        input_topic: impl Into<String>,
        output_topic: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            consumer_group: name.clone(),
            name,
            input_topic: input_topic.into(),
            output_topic: Some(output_topic.into()),
            middleware: Vec::new(),
        }
    }

    /// A handler that only consumes; outputs it returns are discarded.
    pub fn consumer_only(name: impl Into<String>, input_topic: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            consumer_group: name.clone(),
            name,
            input_topic: input_topic.into(),
            output_topic: None,
            middleware: Vec::new(),
        }
    }

    pub fn with_consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = consumer_group.into();
        self
    }

    /// Add middleware applied to this handler only, inside router middleware.
    pub fn with_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_topic(&self) -> &str {
        &self.input_topic
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn output_topic(&self) -> Option<&str> {
        self.output_topic.as_deref()
    }

    pub(crate) fn middleware(&self) -> &[Arc<dyn Middleware>] {
        &self.middleware
    }
}

/// Counters reported when a handler loop stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandlerStats {
    pub acked: u64,
    pub nacked: u64,
    pub published: u64,
}

/// One handler's consumption loop.
pub(crate) struct HandlerLoop {
    pub(crate) name: String,
    pub(crate) input_topic: String,
    pub(crate) output_topic: Option<String>,
    pub(crate) func: HandlerFunc,
    pub(crate) broker: Arc<dyn BrokerClient>,
    pub(crate) subscription: Subscription,
    pub(crate) stats: HandlerStats,
}

impl HandlerLoop {
    /// Consume until `shutdown` fires or the subscription ends.
    ///
    /// Cancellation is only observed between deliveries, so an invocation
    /// that has started always runs to its ack or nack.
    pub(crate) async fn run(mut self, shutdown: CancellationToken) -> HandlerStats {
        info!(handler = %self.name, topic = %self.input_topic, "Handler started");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.subscription.next() => match next {
                    Some(delivery) => delivery,
                    None => {
                        warn!(handler = %self.name, "Subscription ended");
                        break;
                    }
                },
            };
            self.process(delivery).await;
        }

        info!(
            handler = %self.name,
            acked = self.stats.acked,
            nacked = self.stats.nacked,
            published = self.stats.published,
            "Handler stopped"
        );
        self.stats
    }

    async fn process(&mut self, delivery: Delivery) {
        let Delivery { mut envelope, ack } = delivery;
        envelope.set_metadata(metadata_keys::HANDLER_NAME, &self.name);
        envelope.set_metadata(metadata_keys::RECEIVED_TOPIC, &self.input_topic);

        let id = envelope.id().to_string();
        let attempt = envelope.delivery_attempt();
        debug!(handler = %self.name, id = %id, attempt, "Processing envelope");

        // A panic in user code becomes a nack; it never ends the loop.
        let outcome = match invoke_guarded(Arc::clone(&self.func), envelope).await {
            Ok(outputs) => self.publish_outputs(outputs).await.map_err(HandlerError::from),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(published) => {
                self.stats.published += published;
                match ack.ack().await {
                    Ok(()) => self.stats.acked += 1,
                    Err(e) => warn!(handler = %self.name, id = %id, error = %e, "Failed to ack envelope"),
                }
            }
            Err(e) => {
                warn!(
                    handler = %self.name,
                    id = %id,
                    attempt,
                    kind = e.kind(),
                    error = %e,
                    "Handler failed, nacking envelope"
                );
                self.stats.nacked += 1;
                if let Err(e) = ack.nack().await {
                    warn!(handler = %self.name, id = %id, error = %e, "Failed to nack envelope");
                }
            }
        }
    }

    /// Publish outputs in order, stopping at the first failure.
    async fn publish_outputs(&mut self, outputs: Vec<Envelope>) -> Result<u64, TransportError> {
        let Some(topic) = self.output_topic.as_deref() else {
            if !outputs.is_empty() {
                warn!(
                    handler = %self.name,
                    discarded = outputs.len(),
                    "Consumer-only handler returned outputs, discarding"
                );
            }
            return Ok(0);
        };

        let mut published = 0;
        for output in outputs {
            self.broker.publish(topic, output).await?;
            published += 1;
        }
        Ok(published)
    }
}
