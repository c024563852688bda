//! Scripted backend for tests (feature `testing`).

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use peer_sync_core::commands::{ExecuteRequest, InterruptResult};
use serde_json::Value;

use crate::backend::{Backend, BackendError, OutputStream};

enum Script {
    Outputs(Vec<Value>),
    Stall(Vec<Value>),
    Failure(String),
}

/// Decrements the open-stream count when its output stream is dropped.
struct OpenStream(Arc<AtomicUsize>);

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Backend whose executions are scripted per source code.
///
/// Code with no script executes successfully with no outputs.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: HashMap<String, Script>,
    status: Option<Value>,
    interrupt: Option<InterruptResult>,
    calls: Mutex<Calls>,
    open: Arc<AtomicUsize>,
}

#[derive(Default)]
struct Calls {
    executed: Vec<ExecuteRequest>,
    restarts: usize,
    interrupts: Vec<Duration>,
    directory: Option<String>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Executing `code` yields `outputs` and finishes.
    #[must_use]
    pub fn with_outputs(mut self, code: &str, outputs: Vec<Value>) -> Self {
        self.scripts.insert(code.to_string(), Script::Outputs(outputs));
        self
    }

    /// Executing `code` yields `outputs` and then never finishes.
    #[must_use]
    pub fn with_stall(mut self, code: &str, outputs: Vec<Value>) -> Self {
        self.scripts.insert(code.to_string(), Script::Stall(outputs));
        self
    }

    /// Executing `code` fails with `message`.
    #[must_use]
    pub fn with_failure(mut self, code: &str, message: &str) -> Self {
        self.scripts
            .insert(code.to_string(), Script::Failure(message.to_string()));
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: Value) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_interrupt(mut self, result: InterruptResult) -> Self {
        self.interrupt = Some(result);
        self
    }

    fn calls(&self) -> std::sync::MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Output streams handed out and not yet dropped.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    fn track(&self, outputs: OutputStream) -> OutputStream {
        self.open.fetch_add(1, Ordering::SeqCst);
        let guard = OpenStream(Arc::clone(&self.open));
        outputs
            .map(move |item| {
                let _open = &guard;
                item
            })
            .boxed()
    }

    #[must_use]
    pub fn executed(&self) -> Vec<ExecuteRequest> {
        self.calls().executed.clone()
    }

    #[must_use]
    pub fn restarts(&self) -> usize {
        self.calls().restarts
    }

    #[must_use]
    pub fn interrupt_timeouts(&self) -> Vec<Duration> {
        self.calls().interrupts.clone()
    }

    #[must_use]
    pub fn initial_directory(&self) -> Option<String> {
        self.calls().directory.clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn execute(&self, request: &ExecuteRequest) -> Result<OutputStream, BackendError> {
        self.calls().executed.push(request.clone());
        let outputs = match self.scripts.get(&request.code) {
            Some(Script::Failure(message)) => {
                return Err(BackendError::Execution(message.clone()));
            }
            Some(Script::Outputs(outputs)) => {
                futures::stream::iter(outputs.clone().into_iter().map(Ok)).boxed()
            }
            Some(Script::Stall(outputs)) => futures::stream::iter(outputs.clone().into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed(),
            None => futures::stream::empty().boxed(),
        };
        Ok(self.track(outputs))
    }

    async fn restart(&self) -> Result<(), BackendError> {
        self.calls().restarts += 1;
        Ok(())
    }

    async fn interrupt(&self, timeout: Duration) -> Result<InterruptResult, BackendError> {
        self.calls().interrupts.push(timeout);
        Ok(self.interrupt.unwrap_or(InterruptResult::Success))
    }

    async fn status_cell(&self) -> Result<Option<Value>, BackendError> {
        Ok(self.status.clone())
    }

    async fn set_initial_directory(&self, directory: &str) -> Result<(), BackendError> {
        self.calls().directory = Some(directory.to_string());
        Ok(())
    }
}
