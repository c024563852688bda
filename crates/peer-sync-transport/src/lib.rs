//! Channels the synchronization layer runs over.
//!
//! Provides:
//! - `LocalSession` / `LocalPeer` - In-process hub implementing `PeerChannel`

pub mod local;

#[cfg(test)]
mod scenarios;

pub use local::{LocalPeer, LocalSession};
