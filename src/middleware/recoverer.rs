use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use tracing::error;

use super::Middleware;
use crate::error::HandlerError;
use crate::message::Envelope;
use crate::router::{HandlerFunc, HandlerFuture};

/// Converts a panic in the wrapped chain into `HandlerError::Panic`.
///
/// Both the synchronous call and the returned future are guarded. Installed
/// inside `Retry` and `PoisonQueue`, a panic is retried and poisoned like any
/// other failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct Recoverer;

impl Middleware for Recoverer {
    fn wrap(&self, next: HandlerFunc) -> HandlerFunc {
        Arc::new(move |envelope: Envelope| -> HandlerFuture {
            invoke_guarded(Arc::clone(&next), envelope)
        })
    }
}

/// Invoke `func` once, turning a panic in the call or its future into
/// `HandlerError::Panic`.
pub(crate) fn invoke_guarded(func: HandlerFunc, envelope: Envelope) -> HandlerFuture {
    Box::pin(async move {
        let id = envelope.id().to_string();

        let invocation = match catch_unwind(AssertUnwindSafe(|| func(envelope))) {
            Ok(invocation) => invocation,
            Err(panic) => return Err(recovered(&id, panic)),
        };

        match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(recovered(&id, panic)),
        }
    })
}

fn recovered(id: &str, panic: Box<dyn Any + Send>) -> HandlerError {
    let message = panic_message(panic.as_ref());
    error!(id = %id, panic = %message, "Recovered from handler panic");
    HandlerError::Panic(message)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
