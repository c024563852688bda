//! The execution backend owned by the hosting peer.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use peer_sync_core::commands::{ExecuteRequest, InterruptResult};
use serde_json::Value;
use thiserror::Error;

/// Outputs of one execution, in emission order.
pub type OutputStream = BoxStream<'static, Result<Value, BackendError>>;

/// Backend error.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Execution failed: {0}")]
    Execution(String),
}

/// The real execution engine behind the shared service.
///
/// Only the host holds one; guests reach it through the proxy.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Start executing `request`, streaming its outputs.
    async fn execute(&self, request: &ExecuteRequest) -> Result<OutputStream, BackendError>;

    /// Force a restart.
    async fn restart(&self) -> Result<(), BackendError>;

    /// Interrupt the running execution, waiting at most `timeout`.
    async fn interrupt(&self, timeout: Duration) -> Result<InterruptResult, BackendError>;

    /// Current session status artifact, if any.
    async fn status_cell(&self) -> Result<Option<Value>, BackendError>;

    /// Set the working directory new executions start in.
    async fn set_initial_directory(&self, directory: &str) -> Result<(), BackendError>;
}
