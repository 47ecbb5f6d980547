use serde::{Deserialize, Serialize};

use crate::utils::MessagingError;

/// The wire-neutral unit of data exchanged between devices and services.
///
/// Every broker connector serializes a `Message` with the same binary
/// layout, so a subscriber can be moved from one backend to another without
/// reinterpreting payloads.
///
/// # Fields
///
/// - `channel` - The channel the message was published to.
/// - `subtopic` - Optional dot-separated suffix under the channel.
/// - `publisher` - Identity of the publishing thing.
/// - `protocol` - Tag of the protocol the message entered through.
/// - `payload` - Opaque content; may be empty.
/// - `created` - Unix timestamp in nanoseconds, assigned at ingress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub channel: String,
    pub subtopic: String,
    pub publisher: String,
    pub protocol: String,
    pub payload: Vec<u8>,
    pub created: i64,
}

impl Message {
    /// Current time in the resolution used by `created`.
    pub fn now() -> i64 {
        let now = chrono::Utc::now();
        now.timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessagingError> {
        bincode::serialize(self).map_err(|e| MessagingError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessagingError> {
        bincode::deserialize(data).map_err(|e| MessagingError::Decode(e.to_string()))
    }
}
