//! The `Event -> ProcessedEvent` pipeline and its router wiring.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::broker::BrokerClient;
use crate::error::RouterError;
use crate::message::JsonCodec;
use crate::middleware::{CorrelationId, PoisonQueue, Recoverer, Retry};
use crate::router::{typed_handler, HandlerRegistration, Router};
use crate::types::{Event, PipelineConfig, ProcessedEvent};

/// Turn one event into its processed form, stamped with the current time.
pub async fn process_event(event: Event) -> anyhow::Result<Vec<ProcessedEvent>> {
    info!(id = event.id, "Received event");
    Ok(vec![ProcessedEvent {
        processed_id: event.id,
        time: Utc::now(),
    }])
}

/// Build a router running `process_event` from the input to the output topic.
///
/// Router middleware, outermost first: `CorrelationId`, `PoisonQueue` (when
/// enabled), `Retry` (when enabled), `Recoverer`. The poison queue sits
/// outside retry so it only sees failures that survived every retry, and the
/// recoverer sits innermost so panics are retried and poisoned like errors.
pub fn build_router(
    config: &PipelineConfig,
    broker: Arc<dyn BrokerClient>,
) -> Result<Router, RouterError> {
    let mut router = Router::new(config.router.clone(), Arc::clone(&broker));

    router.add_middleware(CorrelationId);
    if config.poison.enabled {
        router.add_middleware(PoisonQueue::new(
            broker,
            config.topics.poison.clone(),
            config.poison.max_attempts,
        ));
    }
    if config.retry.enabled {
        router.add_middleware(Retry::from_config(&config.retry));
    }
    router.add_middleware(Recoverer);

    router.add_handler(
        HandlerRegistration::new(
            config.handler.name.clone(),
            config.topics.input.clone(),
            config.topics.output.clone(),
        )
        .with_consumer_group(config.handler.consumer_group.clone()),
        typed_handler(JsonCodec, process_event),
    )?;

    Ok(router)
}
