//! Capabilities shared by the host and guest roles.

use async_trait::async_trait;
use peer_sync_core::Args;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProxyError;

/// What the local user may do in the collaboration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    /// Read-only; a host that is not in sync is tolerated.
    Observer,
    /// Active participant; requires a host that confirms sync.
    Collaborator,
}

/// One peer's view of the shared execution service.
///
/// `HostRole` answers locally from the real backend; `RemoteExecutionProxy`
/// forwards over the channel.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Broadcast a command to every peer.
    ///
    /// # Errors
    /// Returns error if the channel rejects the broadcast.
    fn send_broadcast(&self, command: &str, args: Args) -> Result<(), ProxyError>;

    /// Issue a request and await its single reply.
    async fn send_request(&self, command: &str, args: Args) -> Result<Value, ProxyError>;

    /// Called once the peer joins a session.
    async fn on_attach(&self, role: SessionRole) -> Result<(), ProxyError>;
}
