//! Inbound record kinds and their payload codec.
//!
//! Every record on the statistics topic carries a `type` header naming its kind.
//! The payload is the JSON encoding of a [`Sample`] or a [`DeleteRequest`].

use crate::error::{CoreError, Result};
use crate::stats::{DeleteRequest, Sample};
use std::fmt;
use std::str::FromStr;

/// Header carrying the record kind.
pub const MESSAGE_TYPE_HEADER: &str = "type";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Stats,
    Delete,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Stats => "stats",
            MessageKind::Delete => "delete",
        }
    }

    /// Parse a raw header value. Returns `None` for anything but the two known tags.
    pub fn from_header_value(value: &[u8]) -> Option<Self> {
        match value {
            b"stats" => Some(MessageKind::Stats),
            b"delete" => Some(MessageKind::Delete),
            _ => None,
        }
    }
}

impl FromStr for MessageKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_header_value(s.as_bytes()).ok_or_else(|| CoreError::UnknownKind(s.to_string()))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded inbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Stats(Sample),
    Delete(DeleteRequest),
}

impl Message {
    pub fn decode(kind: MessageKind, payload: &[u8]) -> Result<Self> {
        Ok(match kind {
            MessageKind::Stats => Message::Stats(serde_json::from_slice(payload)?),
            MessageKind::Delete => Message::Delete(serde_json::from_slice(payload)?),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Message::Stats(sample) => serde_json::to_vec(sample)?,
            Message::Delete(request) => serde_json::to_vec(request)?,
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Stats(_) => MessageKind::Stats,
            Message::Delete(_) => MessageKind::Delete,
        }
    }

    pub fn keystem(&self) -> &str {
        match self {
            Message::Stats(sample) => &sample.used_keystem,
            Message::Delete(request) => &request.used_keystem,
        }
    }
}
