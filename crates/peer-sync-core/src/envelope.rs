//! Response envelopes streamed from the host to guests.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structural key of one streaming call.
///
/// Two tags are the same call iff all four fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallTag {
    pub code: String,
    pub file: String,
    pub line: u32,
    pub id: String,
}

impl CallTag {
    #[must_use]
    pub fn new(
        code: impl Into<String>,
        file: impl Into<String>,
        line: u32,
        id: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            file: file.into(),
            line,
            id: id.into(),
        }
    }
}

/// Position of an envelope within its call's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Start,
    Update,
    Finish,
    Error,
}

impl ResponseKind {
    /// `finish` and `error` end a call.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finish | Self::Error)
    }
}

/// One streamed (or replayed) result produced by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(default)]
    pub tag: Option<CallTag>,
    #[serde(default)]
    pub payload: Value,
    /// Host emission time, milliseconds since the Unix epoch.
    #[serde(default)]
    pub time: u64,
    /// Position within the call, counting from `start` at 0. Lets a guest
    /// drop envelopes it already saw when a catch-up replay repeats them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl ResponseEnvelope {
    /// Create an envelope stamped with the current time.
    #[must_use]
    pub fn now(kind: ResponseKind, tag: CallTag, payload: Value) -> Self {
        Self {
            kind,
            tag: Some(tag),
            payload,
            time: timestamp_ms(),
            seq: None,
        }
    }

    #[must_use]
    pub const fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Human-readable failure text of an `error` envelope.
    #[must_use]
    pub fn error_message(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("message") {
                Some(Value::String(s)) => s.clone(),
                _ => self.payload.to_string(),
            },
            other => other.to_string(),
        }
    }

    /// Approximate in-memory size, used for history bounds.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 64;
        let tag_bytes = self
            .tag
            .as_ref()
            .map_or(0, |t| t.code.len() + t.file.len() + t.id.len());
        OVERHEAD + tag_bytes + self.payload.to_string().len()
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
