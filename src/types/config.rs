//! Configuration types for the pipeline.
//!
//! Values are layered with the `config` crate: built-in defaults, then an
//! optional file, then `PIPELINE__SECTION__KEY` environment variables.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_PARTITIONS, DEFAULT_POISON_MAX_ATTEMPTS};

/// Which broker client implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// In-process broker, for tests and local runs.
    Memory,
    /// Kafka via librdkafka. Requires the `kafka` feature.
    Kafka,
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    /// Broker network addresses (`host:port`)
    pub addresses: Vec<String>,
    /// Partitions per topic; also drives the consistent-hash partitioner
    pub partitions: u32,
    /// Client id reported to the broker
    pub client_id: String,
    /// Consumer session timeout
    pub session_timeout_ms: u64,
    /// Timeout for the initial connectivity check
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Memory,
            addresses: vec!["localhost:29092".to_string()],
            partitions: DEFAULT_PARTITIONS,
            client_id: "event-router".to_string(),
            session_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl BrokerConfig {
    /// Addresses joined the way librdkafka expects them.
    pub fn bootstrap_servers(&self) -> String {
        self.addresses.join(",")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Topic names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub input: String,
    pub output: String,
    /// Dead-letter destination for poisoned envelopes
    pub poison: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            input: "events".to_string(),
            output: "events-processed".to_string(),
            poison: "events-poison".to_string(),
        }
    }
}

/// Name and consumer group of the pipeline handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Handler name, unique within a router
    pub name: String,
    pub consumer_group: String,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            name: "ci-service".to_string(),
            consumer_group: "handler_1".to_string(),
        }
    }
}

/// Router lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// How long stopping handlers may drain before they are abandoned
    pub close_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
        }
    }
}

impl RouterConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Retry middleware settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Re-invocations after the first failure
    pub max_retries: u32,
    pub initial_interval_ms: u64,
    /// Backoff growth factor per retry
    pub multiplier: f64,
    pub max_interval_ms: u64,
    /// Randomize each delay to 50-100% of its value
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            initial_interval_ms: 100,
            multiplier: 2.0,
            max_interval_ms: 5_000,
            jitter: true,
        }
    }
}

/// Poison-queue middleware settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoisonConfig {
    pub enabled: bool,
    /// Delivery attempts before an envelope is routed to the poison topic
    pub max_attempts: u32,
}

impl Default for PoisonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_POISON_MAX_ATTEMPTS,
        }
    }
}

/// Synthetic producer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
        }
    }
}

impl ProducerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// HTTP ingress settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3017,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub handler: HandlerConfig,
    pub router: RouterConfig,
    pub retry: RetryConfig,
    pub poison: PoisonConfig,
    pub producer: ProducerConfig,
    pub http: HttpConfig,
}

impl PipelineConfig {
    /// Prefix for environment overrides, e.g. `PIPELINE__TOPICS__INPUT`.
    pub const ENV_PREFIX: &'static str = "PIPELINE";

    /// Load defaults, then `path` (if given), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let environment = Environment::with_prefix(Self::ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("broker.addresses")
            .try_parsing(true)
            .source(env);

        let config: Self = builder.add_source(environment).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.addresses.is_empty() && self.broker.backend == BrokerBackend::Kafka {
            return Err(ConfigError::Invalid(
                "broker.addresses must not be empty".to_string(),
            ));
        }
        if self.broker.partitions == 0 {
            return Err(ConfigError::Invalid(
                "broker.partitions must be at least 1".to_string(),
            ));
        }
        for (name, topic) in [
            ("topics.input", &self.topics.input),
            ("topics.output", &self.topics.output),
            ("topics.poison", &self.topics.poison),
        ] {
            if topic.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} must not be empty")));
            }
        }
        if self.producer.enabled && self.producer.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "producer.interval_ms must be at least 1".to_string(),
            ));
        }
        if self.poison.enabled && self.poison.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "poison.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
