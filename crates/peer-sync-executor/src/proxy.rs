//! Guest-side proxy to the host's execution backend.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use peer_sync_core::{
    Args, PeerChannel, ResponseEnvelope, SharedService, SyncConfig,
    commands::{self, CatchupRequest, ExecuteRequest, InterruptResult},
    timestamp_ms,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    ProxyError, ResponseCorrelator, ResponseStream,
    participant::{Participant, SessionRole},
};

/// Turns local calls into channel traffic to the hosting peer.
///
/// Streaming calls go out as one-way notifications and come back as tagged
/// `serverResponse` envelopes; everything else is a direct request.
pub struct RemoteExecutionProxy {
    channel: Arc<dyn PeerChannel>,
    correlator: ResponseCorrelator,
    config: SyncConfig,
    started_at: u64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteExecutionProxy {
    /// Create a proxy. Catch-up after `attach` covers everything the host
    /// emitted since this moment.
    #[must_use]
    pub fn new(channel: Arc<dyn PeerChannel>, config: SyncConfig) -> Self {
        Self {
            correlator: ResponseCorrelator::from_config(&config),
            channel,
            config,
            started_at: timestamp_ms(),
            pump: Mutex::new(None),
        }
    }

    /// Override the catch-up start time (milliseconds since the Unix epoch).
    #[must_use]
    pub fn with_start_time(mut self, started_at: u64) -> Self {
        self.started_at = started_at;
        self
    }

    #[must_use]
    pub const fn correlator(&self) -> &ResponseCorrelator {
        &self.correlator
    }

    /// Start a streaming execution on the host.
    ///
    /// Returns immediately. If the host is unreachable the stream fails with
    /// `ServiceUnavailable`.
    #[must_use]
    pub fn execute_streaming(&self, request: &ExecuteRequest) -> ResponseStream {
        let tag = request.tag();
        let stream = self.correlator.register(tag.clone());
        match self.service() {
            Ok(service) => service.notify(commands::EXECUTE_STREAMING, request.to_payload()),
            Err(e) => {
                tracing::warn!(id = %request.id, error = %e, "cannot start remote execution");
                self.correlator.fail(&tag, e);
            }
        }
        stream
    }

    /// Run `request` on the host and return its last output.
    ///
    /// # Errors
    /// Returns `Cancelled` if `cancel` fires first; otherwise the remote
    /// failure, `ServiceUnavailable` or `OrphanedCall`.
    pub async fn execute(
        &self,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, ProxyError> {
        self.execute_streaming(request).aggregate(cancel).await
    }

    /// Send a request to the host and await exactly one reply.
    ///
    /// # Errors
    /// Returns `ServiceUnavailable` if no host shares the service, or the
    /// host's failure.
    pub async fn request_singular(&self, command: &str, args: Args) -> Result<Value, ProxyError> {
        let service = self.service()?;
        Ok(service.request(command, args).await?)
    }

    /// Force the host's backend to restart.
    ///
    /// # Errors
    /// See [`Self::request_singular`].
    pub async fn restart_kernel(&self) -> Result<(), ProxyError> {
        self.request_singular(commands::RESTART, Vec::new()).await?;
        Ok(())
    }

    /// Interrupt the running execution with the configured timeout.
    ///
    /// # Errors
    /// See [`Self::request_singular`]; also fails on an unrecognized reply.
    pub async fn interrupt_kernel(&self) -> Result<InterruptResult, ProxyError> {
        let timeout = self.config.interrupt_timeout_ms;
        let reply = self
            .request_singular(commands::INTERRUPT, vec![Value::from(timeout)])
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Fetch the session status artifact.
    ///
    /// # Errors
    /// See [`Self::request_singular`].
    pub async fn status_cell(&self) -> Result<Option<Value>, ProxyError> {
        let reply = self
            .request_singular(commands::GET_STATUS_CELL, Vec::new())
            .await?;
        Ok((!reply.is_null()).then_some(reply))
    }

    /// Set the backend's initial working directory.
    ///
    /// # Errors
    /// See [`Self::request_singular`].
    pub async fn set_initial_directory(&self, directory: &str) -> Result<(), ProxyError> {
        self.request_singular(
            commands::SET_INITIAL_DIRECTORY,
            vec![Value::from(directory)],
        )
        .await?;
        Ok(())
    }

    /// Join a session already in progress.
    ///
    /// Probes the host, subscribes to its response stream and asks it to
    /// replay everything emitted since this proxy started.
    ///
    /// # Errors
    /// Returns `SyncFailure` if the host does not confirm sync and `role` is
    /// `Collaborator`.
    pub async fn attach(&self, role: SessionRole) -> Result<(), ProxyError> {
        let service = self.channel.shared_service(&self.config.execution_service);

        let synced = match &service {
            Some(service) => match service.request(commands::SYNC_REQUEST, Vec::new()).await {
                Ok(reply) => !matches!(reply, Value::Null | Value::Bool(false)),
                Err(e) => {
                    tracing::warn!(error = %e, "sync probe failed");
                    false
                }
            },
            None => false,
        };
        if !synced && role == SessionRole::Collaborator {
            return Err(ProxyError::SyncFailure);
        }

        let Some(service) = service else {
            tracing::info!(?role, "no host to attach to; observing only");
            return Ok(());
        };

        let mut responses = service.on_notify(commands::SERVER_RESPONSE);
        let correlator = self.correlator.clone();
        let name = self.config.execution_service.clone();
        let pump = tokio::spawn(async move {
            while let Some(payload) = responses.recv().await {
                match serde_json::from_value::<ResponseEnvelope>(payload) {
                    Ok(envelope) => correlator.ingest(envelope),
                    Err(e) => tracing::debug!(error = %e, "ignoring malformed server response"),
                }
            }
            tracing::warn!(service = %name, "host stopped responding; failing pending calls");
            correlator.fail_all(&ProxyError::ServiceUnavailable(name));
        });
        if let Some(previous) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(pump)
        {
            previous.abort();
        }

        let catchup = CatchupRequest {
            since: self.started_at,
        };
        service.notify(commands::CATCHUP_REQUEST, serde_json::to_value(catchup)?);
        tracing::info!(since = self.started_at, synced, "attached to host");
        Ok(())
    }

    /// Stop listening and orphan every pending call.
    pub fn dispose(&self) {
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
        self.correlator.dispose();
    }

    fn service(&self) -> Result<Arc<dyn SharedService>, ProxyError> {
        let name = &self.config.execution_service;
        self.channel
            .shared_service(name)
            .ok_or_else(|| ProxyError::ServiceUnavailable(name.clone()))
    }
}

impl Drop for RemoteExecutionProxy {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[async_trait]
impl Participant for RemoteExecutionProxy {
    fn send_broadcast(&self, command: &str, args: Args) -> Result<(), ProxyError> {
        Ok(self.channel.broadcast(command, args)?)
    }

    async fn send_request(&self, command: &str, args: Args) -> Result<Value, ProxyError> {
        self.request_singular(command, args).await
    }

    async fn on_attach(&self, role: SessionRole) -> Result<(), ProxyError> {
        self.attach(role).await
    }
}
