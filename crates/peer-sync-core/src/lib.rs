//! Shared building blocks for collaborative peer synchronization.
//!
//! This crate provides:
//! - `PeerIdentity` / `CorrelationKey` - Opaque peer and barrier identifiers
//! - `ResponseEnvelope` / `CallTag` - Streamed host results and their routing key
//! - `PeerChannel` / `SharedService` - The channel contracts everything runs over
//! - `ResponseLog` - Host-side history for catch-up replay
//! - `SyncConfig` - Tunables shared by all roles

pub mod channel;
pub mod commands;
pub mod config;
pub mod envelope;
pub mod identity;
pub mod response_log;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use channel::{Args, ChannelError, PeerChannel, RequestHandler, SharedService};
pub use config::SyncConfig;
pub use envelope::{CallTag, ResponseEnvelope, ResponseKind, timestamp_ms};
pub use identity::{CorrelationKey, PeerIdentity};
pub use response_log::ResponseLog;
