//! Core types for the event router.

mod config;
mod event;

pub use config::{
    BrokerBackend, BrokerConfig, HandlerConfig, HttpConfig, PipelineConfig, PoisonConfig,
    ProducerConfig, RetryConfig, RouterConfig, TopicConfig,
};
pub use event::{Event, ProcessedEvent};
