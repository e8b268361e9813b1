use std::sync::Arc;

use super::Middleware;
use crate::message::{metadata_keys, Envelope};
use crate::router::{HandlerFunc, HandlerFuture};

/// Copies the input's correlation id onto every output.
///
/// An input without one is its own origin, so its envelope id is used.
/// Outputs that already carry a correlation id keep it.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationId;

impl Middleware for CorrelationId {
    fn wrap(&self, next: HandlerFunc) -> HandlerFunc {
        Arc::new(move |envelope: Envelope| -> HandlerFuture {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let correlation = envelope
                    .metadata(metadata_keys::CORRELATION_ID)
                    .unwrap_or(envelope.id())
                    .to_string();

                next(envelope).await.map(|outputs| {
                    outputs
                        .into_iter()
                        .map(|output| {
                            if output.metadata(metadata_keys::CORRELATION_ID).is_some() {
                                output
                            } else {
                                output.with_metadata(metadata_keys::CORRELATION_ID, correlation.clone())
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
        })
    }
}
