//! Domain payloads carried inside envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An input event, as produced by the synthetic producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
}

/// The derived record published for every processed `Event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub processed_id: i64,
    /// Processing time, serialized as an RFC 3339 timestamp.
    pub time: DateTime<Utc>,
}
