//! Payload codecs.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DecodeError, EncodeError};

/// Converts typed payloads to and from envelope bytes.
///
/// Implementations must satisfy `decode(encode(x)) == x` for every value
/// they can encode. Malformed input is reported as `DecodeError`, never as a
/// panic.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Encode a value into payload bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, EncodeError>;

    /// Decode payload bytes into a value.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, DecodeError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(value).map_err(EncodeError)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
