//! Three peers sharing one execution backend in-process.
//!
//! Run with: cargo run -p shared-session-demo [config.json]
//!
//! Set `RUST_LOG=debug` to watch the barrier and correlator at work.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use peer_sync_core::{
    SyncConfig,
    commands::{ExecuteRequest, InterruptResult},
};
use peer_sync_executor::{
    Backend, BackendError, HostRole, OutputStream, RemoteExecutionProxy, SessionRole,
};
use peer_sync_session::CreationBarrier;
use peer_sync_transport::LocalSession;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Evaluates `name = value` lines and remembers the bindings.
#[derive(Default)]
struct AssignmentBackend {
    bindings: Mutex<BTreeMap<String, Value>>,
}

impl AssignmentBackend {
    fn evaluate(&self, line: &str) -> Result<Value, BackendError> {
        let (name, value) = line
            .split_once('=')
            .ok_or_else(|| BackendError::Execution(format!("cannot evaluate `{line}`")))?;
        let name = name.trim().to_string();
        let value = serde_json::from_str(value.trim())
            .unwrap_or_else(|_| Value::String(value.trim().to_string()));
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), value.clone());
        Ok(json!({ name: value }))
    }
}

#[async_trait]
impl Backend for AssignmentBackend {
    async fn execute(&self, request: &ExecuteRequest) -> Result<OutputStream, BackendError> {
        let outputs: Vec<_> = request
            .code
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| self.evaluate(line))
            .collect();
        Ok(futures::stream::iter(outputs).boxed())
    }

    async fn restart(&self) -> Result<(), BackendError> {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    async fn interrupt(&self, _timeout: Duration) -> Result<InterruptResult, BackendError> {
        Ok(InterruptResult::Success)
    }

    async fn status_cell(&self) -> Result<Option<Value>, BackendError> {
        let bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        Ok((!bindings.is_empty()).then(|| {
            Value::Object(
                bindings
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            )
        }))
    }

    async fn set_initial_directory(&self, directory: &str) -> Result<(), BackendError> {
        tracing::info!(directory, "initial directory set");
        Ok(())
    }
}

/// The per-peer resource the creation barrier guards.
struct Notebook {
    title: String,
}

fn load_config() -> anyhow::Result<SyncConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config from {path}"))?;
            SyncConfig::from_json(&json).with_context(|| format!("parsing config {path}"))
        }
        None => Ok(SyncConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let session = LocalSession::new();
    let host_peer = session.join();
    let alice = session.join();
    let bob = session.join();

    let barriers: Vec<_> = [&host_peer, &alice, &bob]
        .into_iter()
        .map(|peer| {
            let id = peer.identity();
            CreationBarrier::spawn(id, peer.clone(), move || Notebook {
                title: format!("notebook of {id}"),
            })
        })
        .collect();
    let notebook = barriers[1].ensure_resource_and_synchronize().await?;
    tracing::info!(title = %notebook.title, "every peer has its notebook");

    let _host = HostRole::share(
        host_peer.clone(),
        Arc::new(AssignmentBackend::default()),
        &config,
    )?;

    let alice_proxy = RemoteExecutionProxy::new(alice.clone(), config.clone());
    alice_proxy.attach(SessionRole::Collaborator).await?;
    alice_proxy.set_initial_directory("/tmp").await?;

    let request = ExecuteRequest::new("x = 1\ny = \"two\"", "demo.py", 0, "cell-1");
    let mut outputs = alice_proxy.execute_streaming(&request);
    while let Some(output) = outputs.next().await {
        let output = output?;
        tracing::info!(%output, "alice received");
    }

    // Bob attaches afterwards and catches up from the start of the session.
    let bob_proxy = RemoteExecutionProxy::new(bob.clone(), config.clone()).with_start_time(0);
    bob_proxy.attach(SessionRole::Observer).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let replayed = bob_proxy
        .correlator()
        .register(request.tag())
        .aggregate(&CancellationToken::new())
        .await?;
    tracing::info!(last = ?replayed, "bob caught up");

    let status = bob_proxy.status_cell().await?;
    tracing::info!(?status, "status cell");
    let interrupted = alice_proxy.interrupt_kernel().await?;
    tracing::info!(?interrupted, "interrupt");

    let failed = alice_proxy
        .execute(
            &ExecuteRequest::new("not an assignment", "demo.py", 2, "cell-2"),
            &CancellationToken::new(),
        )
        .await;
    tracing::info!(?failed, "bad cell");

    alice_proxy.dispose();
    bob_proxy.dispose();
    Ok(())
}
