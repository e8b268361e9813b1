//! The transport unit carried through brokers and handlers.

use std::collections::HashMap;

use serde::Serialize;

use super::codec::Codec;
use super::id::new_unique_id;
use crate::error::EncodeError;

/// Well-known metadata keys.
pub mod metadata_keys {
    /// 1-based delivery attempt, set by the broker client on every delivery.
    pub const DELIVERY_ATTEMPT: &str = "delivery_attempt";
    /// Chooses the partition on publish. Falls back to the envelope id.
    pub const PARTITION_KEY: &str = "partition_key";
    /// Correlates outputs with the input that produced them.
    pub const CORRELATION_ID: &str = "correlation_id";
    /// Why an envelope was routed to the poison topic.
    pub const POISON_REASON: &str = "poison_reason";
    /// Topic the poisoned envelope was consumed from.
    pub const POISON_SOURCE_TOPIC: &str = "poison_source_topic";
    /// Handler that gave up on the poisoned envelope.
    pub const POISON_HANDLER: &str = "poison_handler";
    /// Handler that received the envelope, set by the router.
    pub const HANDLER_NAME: &str = "handler_name";
    /// Topic the envelope was received from, set by the router.
    pub const RECEIVED_TOPIC: &str = "received_topic";
}

/// A payload tagged with a unique id and string metadata.
///
/// The id is assigned once at construction and has no setter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    id: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Free-form metadata.
    pub metadata: HashMap<String, String>,
}

impl Envelope {
    /// Create an envelope with a fresh unique id.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: new_unique_id(),
            payload: payload.into(),
            metadata: HashMap::new(),
        }
    }

    /// Encode `value` with `codec` into a new envelope.
    pub fn encode<C: Codec, T: Serialize>(codec: &C, value: &T) -> Result<Self, EncodeError> {
        Ok(Self::new(codec.encode(value)?))
    }

    /// Rebuild an envelope received from a broker, keeping its original id.
    ///
    /// Intended for `BrokerClient` implementations only.
    pub fn from_parts(
        id: String,
        payload: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id,
            payload,
            metadata,
        }
    }

    /// The envelope's unique id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Builder-style metadata insertion.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Delivery attempt recorded by the broker client, 1 if unknown.
    pub fn delivery_attempt(&self) -> u32 {
        self.metadata(metadata_keys::DELIVERY_ATTEMPT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
    }

    /// Key used to pick a partition: `partition_key` metadata, else the id.
    pub fn partition_key(&self) -> &str {
        self.metadata(metadata_keys::PARTITION_KEY)
            .unwrap_or(&self.id)
    }
}
