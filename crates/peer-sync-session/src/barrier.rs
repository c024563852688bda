//! Creation barrier for the shared session resource.
//!
//! The initiating peer creates its own resource, broadcasts `create` and
//! waits until every reachable peer has answered with a matching `ack`.
//! A drop in the peer count releases every pending wait, trading full
//! confirmation for never hanging on a peer that left mid-sync.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use peer_sync_core::{
    ChannelError, CorrelationKey, PeerChannel, PeerIdentity,
    commands::{self, Announcement},
};
use serde_json::Value;
use tokio::{sync::oneshot, task::JoinHandle};

use crate::ResourceFactory;

/// Barrier error.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// One outstanding synchronization started by this peer.
struct SyncRequest {
    remaining: usize,
    completion: oneshot::Sender<()>,
}

impl SyncRequest {
    fn resolve(self) {
        let _ = self.completion.send(());
    }
}

struct State<R> {
    resource: Option<Arc<R>>,
    pending: HashMap<CorrelationKey, SyncRequest>,
    known_peers: usize,
}

/// Keeps exactly one local resource per peer and synchronizes its creation.
pub struct CreationBarrier<R, F> {
    identity: PeerIdentity,
    channel: Arc<dyn PeerChannel>,
    factory: F,
    state: Mutex<State<R>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<R, F> CreationBarrier<R, F>
where
    R: Send + Sync + 'static,
    F: ResourceFactory<R> + 'static,
{
    /// Create a barrier that is not yet listening to the channel.
    #[must_use]
    pub fn new(identity: PeerIdentity, channel: Arc<dyn PeerChannel>, factory: F) -> Arc<Self> {
        let known_peers = channel.peer_count();
        Arc::new(Self {
            identity,
            channel,
            factory,
            state: Mutex::new(State {
                resource: None,
                pending: HashMap::new(),
                known_peers,
            }),
            listener: Mutex::new(None),
        })
    }

    /// Create a barrier and start listening for `create`, `ack` and
    /// peer-count changes. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn spawn(identity: PeerIdentity, channel: Arc<dyn PeerChannel>, factory: F) -> Arc<Self> {
        let barrier = Self::new(identity, channel, factory);
        barrier.listen();
        barrier
    }

    /// Subscribe to the channel and run the handler loop in the background.
    pub fn listen(self: &Arc<Self>) {
        let mut creates = self.channel.on_broadcast(commands::CREATE);
        let mut acks = self.channel.on_broadcast(commands::ACK);
        let mut counts = self.channel.watch_peer_count();
        let weak: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(count) = counts.recv() => {
                        let Some(barrier) = weak.upgrade() else { break };
                        barrier.handle_peer_count_changed(count);
                    }
                    Some(args) = creates.recv() => {
                        let Some(barrier) = weak.upgrade() else { break };
                        barrier.handle_remote_create(&args);
                    }
                    Some(args) = acks.recv() => {
                        let Some(barrier) = weak.upgrade() else { break };
                        barrier.handle_remote_ack(&args);
                    }
                    else => break,
                }
            }
            tracing::debug!("creation barrier listener stopped");
        });

        if let Some(previous) = lock(&self.listener).replace(task) {
            previous.abort();
        }
    }

    /// This peer's identity.
    #[must_use]
    pub const fn identity(&self) -> PeerIdentity {
        self.identity
    }

    /// The local resource, if one exists. Does not synchronize.
    #[must_use]
    pub fn active(&self) -> Option<Arc<R>> {
        self.state().resource.clone()
    }

    /// Number of synchronizations still waiting for acks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Return the local resource once every reachable peer has created its
    /// own, creating the local one first if needed.
    ///
    /// # Errors
    /// Returns error if the `create` announcement cannot be broadcast.
    pub async fn ensure_resource_and_synchronize(&self) -> Result<Arc<R>, BarrierError> {
        let resource = self.ensure_resource();

        let peers = self.channel.peer_count();
        if peers == 0 {
            return Ok(resource);
        }

        let key = CorrelationKey::generate();
        let (completion, done) = oneshot::channel();
        self.state().pending.insert(
            key,
            SyncRequest {
                remaining: peers,
                completion,
            },
        );

        let announcement = Announcement {
            originator: self.identity,
            key,
        };
        if let Err(e) = self.channel.broadcast(commands::CREATE, announcement.to_args()) {
            self.state().pending.remove(&key);
            return Err(e.into());
        }

        tracing::debug!(%key, peers, "waiting for peers to create their resource");
        if done.await.is_err() {
            tracing::debug!(%key, "barrier disposed while waiting");
        }
        Ok(resource)
    }

    /// Forget `resource` if it is still the local one, e.g. after it was
    /// closed. Returns whether it was forgotten.
    pub fn release(&self, resource: &Arc<R>) -> bool {
        let mut state = self.state();
        if state
            .resource
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, resource))
        {
            state.resource = None;
            true
        } else {
            false
        }
    }

    /// Stop listening and drop all state. Pending waiters resolve.
    pub fn dispose(&self) {
        if let Some(task) = lock(&self.listener).take() {
            task.abort();
        }
        let mut state = self.state();
        state.pending.clear();
        state.resource = None;
    }

    /// Handle a `create` announcement from any peer.
    pub fn handle_remote_create(&self, args: &[Value]) {
        let announcement = match Announcement::from_args(args) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed create announcement");
                return;
            }
        };
        if announcement.originator == self.identity {
            return;
        }

        self.ensure_resource();

        if let Err(e) = self
            .channel
            .broadcast(commands::ACK, announcement.to_args())
        {
            tracing::warn!(error = %e, originator = %announcement.originator, "failed to send ack");
        }
    }

    /// Handle an `ack` announcement from any peer.
    pub fn handle_remote_ack(&self, args: &[Value]) {
        let announcement = match Announcement::from_args(args) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed ack");
                return;
            }
        };
        if announcement.originator != self.identity {
            return;
        }

        let mut state = self.state();
        let Some(request) = state.pending.get_mut(&announcement.key) else {
            tracing::debug!(key = %announcement.key, "ack for unknown or resolved sync");
            return;
        };
        request.remaining = request.remaining.saturating_sub(1);
        if request.remaining == 0 {
            if let Some(request) = state.pending.remove(&announcement.key) {
                request.resolve();
            }
        }
    }

    /// Handle a peer-count change; any decrease releases all pending waits.
    pub fn handle_peer_count_changed(&self, count: usize) {
        let mut state = self.state();
        let previous = std::mem::replace(&mut state.known_peers, count);
        if count < previous && !state.pending.is_empty() {
            tracing::info!(
                previous,
                count,
                released = state.pending.len(),
                "peer left; releasing pending creation syncs"
            );
            for (_, request) in state.pending.drain() {
                request.resolve();
            }
        }
    }

    fn ensure_resource(&self) -> Arc<R> {
        let mut state = self.state();
        if let Some(resource) = &state.resource {
            return Arc::clone(resource);
        }
        let resource = Arc::new(self.factory.create());
        state.resource = Some(Arc::clone(&resource));
        resource
    }

    fn state(&self) -> MutexGuard<'_, State<R>> {
        lock(&self.state)
    }
}

impl<R, F> Drop for CreationBarrier<R, F> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.listener).take() {
            task.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
