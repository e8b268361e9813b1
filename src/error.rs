//! Error types for the event router.
//!
//! Per-message failures (`HandlerError`) stay inside one processing attempt
//! and end in a nack or a poison-queue publish. `TransportError` is fatal only
//! while the router is starting; afterwards it nacks the triggering input.

use thiserror::Error;

/// A payload could not be decoded into the expected type.
#[derive(Debug, Error)]
#[error("failed to decode payload: {0}")]
pub struct DecodeError(#[from] pub serde_json::Error);

/// A value could not be encoded into a payload.
#[derive(Debug, Error)]
#[error("failed to encode payload: {0}")]
pub struct EncodeError(#[source] pub serde_json::Error);

/// Failures at the broker client boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to brokers {brokers}: {reason}")]
    Connect { brokers: String, reason: String },

    #[error("failed to publish to topic {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("failed to subscribe to topic {topic} as group {group}: {reason}")]
    Subscribe {
        topic: String,
        group: String,
        reason: String,
    },

    #[error("failed to acknowledge message: {0}")]
    Ack(String),

    #[error("broker client is closed")]
    Closed,
}

/// Failure of one handler invocation, as seen by the middleware chain.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("processing failed: {0}")]
    Processing(#[source] anyhow::Error),

    /// A panic raised by the processing function, caught by `Recoverer` or the
    /// handler loop.
    #[error("handler panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HandlerError {
    /// Short label used in logs and poison-queue metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Decode(_) => "decode",
            HandlerError::Encode(_) => "encode",
            HandlerError::Processing(_) => "processing",
            HandlerError::Panic(_) => "panic",
            HandlerError::Transport(_) => "transport",
        }
    }
}

/// Router configuration and lifecycle errors.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("handler {0} is already registered")]
    DuplicateHandler(String),

    #[error("router has no handlers")]
    NoHandlers,

    #[error("invalid router configuration: {0}")]
    Config(String),

    #[error("{0} handler task(s) panicked")]
    HandlerPanicked(usize),

    #[error("handler {handler} failed to start: {source}")]
    Startup {
        handler: String,
        #[source]
        source: TransportError,
    },
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_kind() {
        let err = HandlerError::Panic("boom".to_string());
        assert_eq!(err.kind(), "panic");
        assert_eq!(err.to_string(), "handler panicked: boom");

        let err = HandlerError::Processing(anyhow::anyhow!("bad input"));
        assert_eq!(err.kind(), "processing");
        assert_eq!(err.to_string(), "processing failed: bad input");
    }

    #[test]
    fn test_startup_error_names_handler() {
        let err = RouterError::Startup {
            handler: "ci-service".to_string(),
            source: TransportError::Subscribe {
                topic: "events".to_string(),
                group: "handler_1".to_string(),
                reason: "unreachable".to_string(),
            },
        };
        let message = err.to_string();
        assert!(message.contains("ci-service"));
        assert!(message.contains("events"));
    }
}
