//! Remote execution over a shared peer service.
//!
//! Provides:
//! - `RemoteExecutionProxy` - Guest-side stand-in for the host's backend
//! - `ResponseCorrelator` / `ResponseStream` - Routing of streamed envelopes to calls
//! - `HostRole` - Shares a `Backend` with guests and serves catch-up
//! - `Participant` - The capability set both roles expose

pub mod backend;
pub mod correlator;
pub mod error;
pub mod host;
pub mod participant;
pub mod proxy;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{Backend, BackendError, OutputStream};
pub use correlator::{CallState, ResponseCorrelator, ResponseStream};
pub use error::ProxyError;
pub use host::HostRole;
pub use participant::{Participant, SessionRole};
pub use proxy::RemoteExecutionProxy;
