//! Wire protocol types
//!
//! Frames are JSON objects tagged with a `type` field, one frame per
//! transport message (a WebSocket text message or a newline-terminated
//! line on plain TCP). Delivery frames are encoded once per publish and
//! shared across all subscriber queues as cheap `Bytes` clones.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests;

/// Maximum topic name length in bytes
pub const MAX_TOPIC_LENGTH: usize = 512;

/// Error reason strings carried in [`ServerFrame::Error`]
pub mod reason {
    /// Frame was not valid JSON or not a recognized frame shape
    pub const MALFORMED_FRAME: &str = "malformed_frame";
    /// Topic name failed validation
    pub const INVALID_TOPIC: &str = "invalid_topic";
    /// Per-connection subscription limit reached
    pub const SUBSCRIPTION_LIMIT: &str = "subscription_limit";
}

/// Errors that can occur during topic validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// Topic name is empty
    Empty,
    /// Topic name exceeds [`MAX_TOPIC_LENGTH`] bytes
    TooLong,
    /// Topic name contains an ASCII control character
    ControlCharacter,
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "topic name is empty"),
            Self::TooLong => write!(f, "topic name exceeds {} bytes", MAX_TOPIC_LENGTH),
            Self::ControlCharacter => write!(f, "topic name contains a control character"),
        }
    }
}

impl std::error::Error for TopicError {}

/// A validated topic name.
///
/// Topics are opaque strings with no hierarchy and no wildcards. The
/// inner `Arc<str>` makes clones cheap enough to pass through events
/// and registry keys without reallocating.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(Arc<str>);

impl Topic {
    /// Validate and intern a topic name.
    pub fn parse(name: &str) -> Result<Self, TopicError> {
        if name.is_empty() {
            return Err(TopicError::Empty);
        }
        if name.len() > MAX_TOPIC_LENGTH {
            return Err(TopicError::TooLong);
        }
        if name.bytes().any(|b| b < 0x20 || b == 0x7f) {
            return Err(TopicError::ControlCharacter);
        }
        Ok(Self(Arc::from(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Allows registry map lookups by &str without constructing a Topic.
impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier for one transport connection, unique for the process
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frames sent by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start receiving messages published to `topic`
    Subscribe { topic: String },
    /// Stop receiving messages published to `topic`
    Unsubscribe { topic: String },
    /// Fan `payload` out to every current subscriber of `topic`
    Publish { topic: String, payload: String },
}

impl ClientFrame {
    /// Decode one frame from raw bytes.
    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// Frames sent by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A delivery: `payload` was published to `topic`
    Message { topic: String, payload: String },
    /// A protocol error notice; the connection stays open
    Error { reason: String, detail: String },
}

impl ServerFrame {
    /// Encode this frame to its wire bytes.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn error(reason: &str, detail: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.to_string(),
            detail: detail.into(),
        }
    }
}

/// Encode a delivery frame without cloning topic or payload.
///
/// Produces exactly the same JSON as [`ServerFrame::Message`]; publish
/// calls this once and hands each subscriber queue a `Bytes` clone.
pub fn encode_delivery(topic: &Topic, payload: &str) -> Result<Bytes, serde_json::Error> {
    #[derive(Serialize)]
    struct Delivery<'a> {
        #[serde(rename = "type")]
        kind: &'static str,
        topic: &'a str,
        payload: &'a str,
    }

    let vec = serde_json::to_vec(&Delivery {
        kind: "message",
        topic: topic.as_str(),
        payload,
    })?;
    Ok(Bytes::from(vec))
}
