//! Channel command names and their payload shapes.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    CallTag, CorrelationKey, PeerIdentity,
    channel::{Args, ChannelError},
};

/// Broadcast: ask every peer to create its local resource.
pub const CREATE: &str = "create";
/// Broadcast: acknowledge a `create`, addressed back to its originator.
pub const ACK: &str = "ack";
/// Notify (guest to host): start a streaming execution.
pub const EXECUTE_STREAMING: &str = "executeStreaming";
/// Notify (host to guests): one response envelope.
pub const SERVER_RESPONSE: &str = "serverResponse";
/// Request: force a backend restart.
pub const RESTART: &str = "restart";
/// Request: interrupt the running execution.
pub const INTERRUPT: &str = "interrupt";
/// Request: fetch the current session status artifact.
pub const GET_STATUS_CELL: &str = "getStatusCell";
/// Request: probe whether the host is ready.
pub const SYNC_REQUEST: &str = "syncRequest";
/// Notify (guest to host): replay envelopes emitted since a timestamp.
pub const CATCHUP_REQUEST: &str = "catchupRequest";
/// Request: set the backend's initial working directory.
pub const SET_INITIAL_DIRECTORY: &str = "setInitialDirectory";

/// Payload shared by `create` and `ack`: `[originator, key]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub originator: PeerIdentity,
    pub key: CorrelationKey,
}

impl Announcement {
    #[must_use]
    pub fn to_args(&self) -> Args {
        vec![
            Value::String(self.originator.to_string()),
            Value::String(self.key.to_string()),
        ]
    }

    /// Decode from broadcast arguments.
    ///
    /// # Errors
    /// Returns error if fewer than two string arguments are present or either
    /// fails to parse.
    pub fn from_args(args: &[Value]) -> Result<Self, ChannelError> {
        let [originator, key, ..] = args else {
            return Err(ChannelError::InvalidPayload(format!(
                "expected [originator, key], got {} args",
                args.len()
            )));
        };
        let originator = string_arg(originator)?
            .parse()
            .map_err(|e| ChannelError::InvalidPayload(format!("originator: {e}")))?;
        let key = string_arg(key)?
            .parse()
            .map_err(|e| ChannelError::InvalidPayload(format!("correlation key: {e}")))?;
        Ok(Self { originator, key })
    }
}

/// Payload of `executeStreaming`: `[code, file, line, id]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub code: String,
    pub file: String,
    pub line: u32,
    pub id: String,
}

impl ExecuteRequest {
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

    /// The call tag responses for this request are routed by.
    #[must_use]
    pub fn tag(&self) -> CallTag {
        CallTag::new(&self.code, &self.file, self.line, &self.id)
    }

    #[must_use]
    pub fn to_payload(&self) -> Value {
        json!([self.code, self.file, self.line, self.id])
    }

    /// Decode a notify payload.
    ///
    /// # Errors
    /// Returns error if the payload is not a `[code, file, line, id]` array.
    pub fn from_payload(payload: &Value) -> Result<Self, ChannelError> {
        let Some([code, file, line, id]) = payload.as_array().map(Vec::as_slice) else {
            return Err(ChannelError::InvalidPayload(format!(
                "expected [code, file, line, id], got {payload}"
            )));
        };
        let line = line
            .as_u64()
            .and_then(|l| u32::try_from(l).ok())
            .ok_or_else(|| ChannelError::InvalidPayload(format!("line: {line}")))?;
        Ok(Self {
            code: string_arg(code)?.to_string(),
            file: string_arg(file)?.to_string(),
            line,
            id: string_arg(id)?.to_string(),
        })
    }
}

/// Payload of `catchupRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupRequest {
    /// Milliseconds since the Unix epoch.
    pub since: u64,
}

/// Reply to `interrupt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptResult {
    Success,
    TimedOut,
    Restarted,
}

fn string_arg(value: &Value) -> Result<&str, ChannelError> {
    value
        .as_str()
        .ok_or_else(|| ChannelError::InvalidPayload(format!("expected string, got {value}")))
}
