//! Message envelope, unique ids and payload codecs.

mod codec;
mod envelope;
mod id;

pub use codec::{Codec, JsonCodec};
pub use envelope::{metadata_keys, Envelope};
pub use id::new_unique_id;
