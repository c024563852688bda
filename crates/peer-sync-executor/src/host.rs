//! Host role: shares the real backend with every guest.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use peer_sync_core::{
    Args, CallTag, ChannelError, PeerChannel, RequestHandler, ResponseEnvelope, ResponseKind,
    ResponseLog, SharedService, SyncConfig,
    commands::{self, CatchupRequest, ExecuteRequest},
};
use serde_json::Value;
use tokio::task::{JoinHandle, JoinSet};

use crate::{
    Backend, BackendError, ProxyError,
    participant::{Participant, SessionRole},
};

/// Answers guest requests from the backend.
struct HostRequests<B> {
    backend: Arc<B>,
    interrupt_timeout: Duration,
}

fn remote(e: BackendError) -> ChannelError {
    ChannelError::Remote(e.to_string())
}

#[async_trait]
impl<B: Backend + 'static> RequestHandler for HostRequests<B> {
    async fn handle(&self, command: &str, args: Args) -> Result<Value, ChannelError> {
        match command {
            commands::SYNC_REQUEST => Ok(Value::Bool(true)),
            commands::RESTART => {
                self.backend.restart().await.map_err(remote)?;
                Ok(Value::Null)
            }
            commands::INTERRUPT => {
                let timeout = args
                    .first()
                    .and_then(Value::as_u64)
                    .map_or(self.interrupt_timeout, Duration::from_millis);
                let result = self.backend.interrupt(timeout).await.map_err(remote)?;
                serde_json::to_value(result).map_err(|e| ChannelError::Remote(e.to_string()))
            }
            commands::GET_STATUS_CELL => Ok(self
                .backend
                .status_cell()
                .await
                .map_err(remote)?
                .unwrap_or(Value::Null)),
            commands::SET_INITIAL_DIRECTORY => {
                let directory = args.first().and_then(Value::as_str).ok_or_else(|| {
                    ChannelError::InvalidPayload("expected [directory]".to_string())
                })?;
                self.backend
                    .set_initial_directory(directory)
                    .await
                    .map_err(remote)?;
                Ok(Value::Null)
            }
            other => Err(ChannelError::UnknownCommand(other.to_string())),
        }
    }
}

struct HostInner<B> {
    backend: Arc<B>,
    requests: Arc<HostRequests<B>>,
    channel: Arc<dyn PeerChannel>,
    service: Arc<dyn SharedService>,
    log: ResponseLog,
}

impl<B: Backend + 'static> HostInner<B> {
    async fn run_execution(self: Arc<Self>, request: ExecuteRequest) {
        let tag = request.tag();
        let mut seq = 0;
        let mut emit = |kind, payload| {
            self.emit(kind, &tag, seq, payload);
            seq += 1;
        };
        tracing::debug!(id = %request.id, file = %request.file, "executing for guest");
        emit(ResponseKind::Start, Value::Null);

        let mut outputs = match self.backend.execute(&request).await {
            Ok(outputs) => outputs,
            Err(e) => {
                emit(ResponseKind::Error, Value::String(e.to_string()));
                return;
            }
        };
        while let Some(output) = outputs.next().await {
            match output {
                Ok(value) => emit(ResponseKind::Update, value),
                Err(e) => {
                    emit(ResponseKind::Error, Value::String(e.to_string()));
                    return;
                }
            }
        }
        emit(ResponseKind::Finish, Value::Null);
    }

    fn emit(&self, kind: ResponseKind, tag: &CallTag, seq: u64, payload: Value) {
        let envelope = ResponseEnvelope::now(kind, tag.clone(), payload).with_seq(seq);
        match serde_json::to_value(&envelope) {
            Ok(value) => {
                self.log.push(envelope);
                self.service.notify(commands::SERVER_RESPONSE, value);
            }
            Err(e) => tracing::error!(error = %e, "failed to encode response envelope"),
        }
    }

    fn replay_since(&self, since: u64) {
        let replay = self.log.since(since);
        tracing::debug!(since, count = replay.len(), "replaying responses for catch-up");
        for envelope in replay {
            match serde_json::to_value(&envelope) {
                Ok(value) => self.service.notify(commands::SERVER_RESPONSE, value),
                Err(e) => tracing::error!(error = %e, "failed to encode replayed envelope"),
            }
        }
    }
}

/// The peer that owns the backend and shares it as a service.
pub struct HostRole<B> {
    inner: Arc<HostInner<B>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    executions: Arc<Mutex<JoinSet<()>>>,
}

impl<B: Backend + 'static> HostRole<B> {
    /// Share `backend` on `channel` and start serving guests.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// Returns error if the service name is already shared.
    pub fn share(
        channel: Arc<dyn PeerChannel>,
        backend: Arc<B>,
        config: &SyncConfig,
    ) -> Result<Self, ProxyError> {
        let requests = Arc::new(HostRequests {
            backend: Arc::clone(&backend),
            interrupt_timeout: config.interrupt_timeout(),
        });
        let service = channel.share_service(
            &config.execution_service,
            Arc::clone(&requests) as Arc<dyn RequestHandler>,
        )?;

        let mut execute_requests = service.on_notify(commands::EXECUTE_STREAMING);
        let mut catchups = service.on_notify(commands::CATCHUP_REQUEST);
        let inner = Arc::new(HostInner {
            backend,
            requests,
            channel,
            service,
            log: ResponseLog::new(config.history_bytes),
        });

        let executions: Arc<Mutex<JoinSet<()>>> = Arc::default();
        let running = Arc::clone(&executions);
        let pump_inner = Arc::clone(&inner);
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(payload) = execute_requests.recv() => {
                        match ExecuteRequest::from_payload(&payload) {
                            Ok(request) => {
                                let mut running = running.lock().unwrap_or_else(PoisonError::into_inner);
                                while running.try_join_next().is_some() {}
                                running.spawn(Arc::clone(&pump_inner).run_execution(request));
                            }
                            Err(e) => tracing::warn!(error = %e, "ignoring malformed execute request"),
                        }
                    }
                    Some(payload) = catchups.recv() => {
                        match serde_json::from_value::<CatchupRequest>(payload) {
                            Ok(catchup) => pump_inner.replay_since(catchup.since),
                            Err(e) => tracing::warn!(error = %e, "ignoring malformed catch-up request"),
                        }
                    }
                    else => break,
                }
            }
        });

        tracing::info!(service = %config.execution_service, "sharing execution backend");
        Ok(Self {
            inner,
            pump: Mutex::new(Some(pump)),
            executions,
        })
    }

    /// Envelopes currently kept for catch-up.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.inner.log.len()
    }

    /// Executions still streaming.
    #[must_use]
    pub fn running_count(&self) -> usize {
        let mut running = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        while running.try_join_next().is_some() {}
        running.len()
    }

    /// Stop serving guests and abort executions still running.
    pub fn dispose(&self) {
        stop(&self.pump, &self.executions);
    }
}

fn stop(pump: &Mutex<Option<JoinHandle<()>>>, executions: &Mutex<JoinSet<()>>) {
    if let Some(pump) = pump.lock().unwrap_or_else(PoisonError::into_inner).take() {
        pump.abort();
    }
    executions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .abort_all();
}

impl<B> Drop for HostRole<B> {
    fn drop(&mut self) {
        stop(&self.pump, &self.executions);
    }
}

#[async_trait]
impl<B: Backend + 'static> Participant for HostRole<B> {
    fn send_broadcast(&self, command: &str, args: Args) -> Result<(), ProxyError> {
        Ok(self.inner.channel.broadcast(command, args)?)
    }

    async fn send_request(&self, command: &str, args: Args) -> Result<Value, ProxyError> {
        Ok(self.inner.requests.handle(command, args).await?)
    }

    async fn on_attach(&self, role: SessionRole) -> Result<(), ProxyError> {
        tracing::debug!(?role, "host attached; nothing to synchronize");
        Ok(())
    }
}
