//! Creation synchronization for the shared session resource.
//!
//! Provides:
//! - `CreationBarrier` - At most one local resource per peer, created on every peer
//!   before the initiator proceeds
//! - `ResourceFactory` - How a peer builds its local resource

pub mod barrier;
pub mod resource;

pub use barrier::{BarrierError, CreationBarrier};
pub use resource::ResourceFactory;
