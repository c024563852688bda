//! Contracts of the broadcast channel and shared services.
//!
//! Inbound traffic is delivered through unbounded receivers handed out at
//! subscription time. Components subscribe before they spawn their pump
//! task, so nothing published after construction is missed.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Positional arguments of a broadcast or request.
pub type Args = Vec<Value>;

/// Channel error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Shared service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Shared service already registered: {0}")]
    AlreadyShared(String),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Remote handler failed: {0}")]
    Remote(String),
    #[error("Channel closed")]
    Closed,
}

/// Broadcast group with peer counting and named shared services.
pub trait PeerChannel: Send + Sync {
    /// Number of other peers currently reachable.
    fn peer_count(&self) -> usize;

    /// Subscribe to peer-count changes. Every change is delivered, in order.
    fn watch_peer_count(&self) -> mpsc::UnboundedReceiver<usize>;

    /// Send a command to every peer in the group.
    ///
    /// # Errors
    /// Returns error if the channel is closed.
    fn broadcast(&self, command: &str, args: Args) -> Result<(), ChannelError>;

    /// Subscribe to a broadcast command.
    fn on_broadcast(&self, command: &str) -> mpsc::UnboundedReceiver<Args>;

    /// Resolve a service shared by another peer.
    fn shared_service(&self, name: &str) -> Option<Arc<dyn SharedService>>;

    /// Share a service from this peer; requests are answered by `handler`.
    ///
    /// # Errors
    /// Returns error if a service with that name is already shared.
    fn share_service(
        &self,
        name: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn SharedService>, ChannelError>;
}

/// One side of a shared request/notify endpoint.
///
/// On the guest side `notify` reaches the host; on the host side it reaches
/// every guest.
#[async_trait]
pub trait SharedService: Send + Sync {
    /// Send a request and await exactly one reply.
    async fn request(&self, command: &str, args: Args) -> Result<Value, ChannelError>;

    /// Fire-and-forget notification. Dropped silently if nobody listens.
    fn notify(&self, command: &str, payload: Value);

    /// Subscribe to notifications sent from the other side.
    fn on_notify(&self, command: &str) -> mpsc::UnboundedReceiver<Value>;
}

/// Answers requests arriving at a shared service.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, command: &str, args: Args) -> Result<Value, ChannelError>;
}
