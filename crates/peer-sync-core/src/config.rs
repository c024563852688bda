//! Synchronization settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default history size limit (16 MB).
const HISTORY_BYTES: usize = 16 * 1024 * 1024;

/// Settings shared by the barrier, proxy and host roles.
///
/// Missing fields fall back to their defaults, so a partial JSON document
/// is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Name of the shared execution service.
    pub execution_service: String,
    /// Timeout sent with `interrupt` requests.
    pub interrupt_timeout_ms: u64,
    /// Unmatched envelopes kept before the oldest is evicted.
    pub envelope_buffer_capacity: usize,
    /// Completed call tags remembered for duplicate suppression.
    pub retired_call_capacity: usize,
    /// Byte bound of the host response log.
    pub history_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            execution_service: "jupyterServerSharedService".to_string(),
            interrupt_timeout_ms: 10_000,
            envelope_buffer_capacity: 256,
            retired_call_capacity: 1024,
            history_bytes: HISTORY_BYTES,
        }
    }
}

impl SyncConfig {
    /// Parse a configuration from JSON.
    ///
    /// # Errors
    /// Returns error if the document is not valid JSON or a field has the
    /// wrong type.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub const fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }
}
