//! Event Router Library
//!
//! A message-routing pipeline: handlers consume envelopes from broker topics,
//! run them through a middleware chain and publish their outputs, with
//! at-least-once delivery and a poison queue for messages that keep failing.

pub mod api;
pub mod broker;
pub mod error;
pub mod message;
pub mod middleware;
pub mod pipeline;
pub mod producer;
pub mod router;
pub mod types;

pub use broker::{publish_raw, BrokerClient, InMemoryBroker};
pub use error::{HandlerError, RouterError, TransportError};
pub use message::{new_unique_id, Codec, Envelope, JsonCodec};
pub use producer::SyntheticProducer;
pub use router::{typed_handler, HandlerRegistration, Router, RouterState};
pub use types::{Event, PipelineConfig, ProcessedEvent};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broker::*;
    pub use crate::error::*;
    pub use crate::message::*;
    pub use crate::middleware::*;
    pub use crate::router::*;
    pub use crate::types::*;
}

/// Default number of partitions per in-memory topic
pub const DEFAULT_PARTITIONS: u32 = 4;

/// Default time stopping handlers get to finish, in milliseconds
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 30_000;

/// Default delivery attempt at which a failing envelope is poisoned
pub const DEFAULT_POISON_MAX_ATTEMPTS: u32 = 3;
