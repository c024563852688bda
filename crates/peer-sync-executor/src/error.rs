//! Errors surfaced by proxied calls.

use peer_sync_core::ChannelError;
use thiserror::Error;

/// Failure of a proxied operation or streaming call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    /// The caller's cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,
    /// The host did not confirm readiness while this peer needs it.
    #[error("Failed to synchronize with the collaboration host")]
    SyncFailure,
    /// No peer is sharing the execution service.
    #[error("Shared service unavailable: {0}")]
    ServiceUnavailable(String),
    /// The correlator was disposed while the call was pending.
    #[error("Call orphaned before it completed")]
    OrphanedCall,
    /// The host or its backend reported a failure.
    #[error("Remote execution failed: {0}")]
    Remote(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Channel error: {0}")]
    Channel(ChannelError),
}

impl From<ChannelError> for ProxyError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::ServiceUnavailable(name) => Self::ServiceUnavailable(name),
            ChannelError::Remote(message) => Self::Remote(message),
            other => Self::Channel(other),
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidResponse(e.to_string())
    }
}
