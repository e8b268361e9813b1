//! # Middleware
//!
//! A middleware takes the next `HandlerFunc` and returns a new one that
//! runs code before, after or instead of it. Router-level middleware is
//! applied outermost in registration order, then per-handler middleware,
//! then the handler itself.
//!
//! ## Provided
//! - `CorrelationId` stamps outputs with the input's correlation id
//! - `PoisonQueue` parks envelopes that keep failing on a poison topic
//! - `Retry` re-invokes the chain in-process with backoff
//! - `Recoverer` turns panics into `HandlerError::Panic`

mod correlation;
mod poison;
mod recoverer;
mod retry;

use std::sync::Arc;

use crate::router::HandlerFunc;

pub use correlation::CorrelationId;
pub use poison::PoisonQueue;
pub use recoverer::Recoverer;
pub(crate) use recoverer::invoke_guarded;
pub use retry::Retry;

/// Wraps a handler function.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: HandlerFunc) -> HandlerFunc;
}

impl<F> Middleware for F
where
    F: Fn(HandlerFunc) -> HandlerFunc + Send + Sync,
{
    fn wrap(&self, next: HandlerFunc) -> HandlerFunc {
        self(next)
    }
}

/// Apply `middleware` around `handler`. The first entry ends up outermost.
pub(crate) fn compose(middleware: &[Arc<dyn Middleware>], handler: HandlerFunc) -> HandlerFunc {
    middleware
        .iter()
        .rev()
        .fold(handler, |next, layer| layer.wrap(next))
}
