//! Pub/sub payloads and channel addressing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broadcast by an instance after it changes a key in the shared store.
///
/// Serialized as `{"Key":"...","PublisherId":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "PublisherId")]
    pub publisher_id: Uuid,
}

impl InvalidationMessage {
    pub fn new(key: impl Into<String>, publisher_id: Uuid) -> Self {
        Self {
            key: key.into(),
            publisher_id,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// A pub/sub channel: either an exact name or a glob pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Literal(String),
    Pattern(String),
}

impl Channel {
    pub fn literal(name: impl Into<String>) -> Self {
        Channel::Literal(name.into())
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Channel::Pattern(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Channel::Literal(name) | Channel::Pattern(name) => name,
        }
    }
}

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Name of the channel the message was published on
    pub channel: String,
    pub payload: Vec<u8>,
}

impl ChannelMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Payload as text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
