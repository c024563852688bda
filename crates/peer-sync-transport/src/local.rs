//! In-process session hub.
//!
//! Every peer joined to a `LocalSession` sees the others' broadcasts and
//! services. Broadcasts are echoed to the sender too, as the live
//! collaboration channel does.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use peer_sync_core::{Args, ChannelError, PeerChannel, PeerIdentity, RequestHandler, SharedService};
use serde_json::Value;
use tokio::sync::mpsc;

type Subscribers<T> = HashMap<String, Vec<mpsc::UnboundedSender<T>>>;

fn publish<T: Clone>(subs: &mut Subscribers<T>, command: &str, value: &T) {
    if let Some(list) = subs.get_mut(command) {
        list.retain(|tx| tx.send(value.clone()).is_ok());
    }
}

fn subscribe<T>(subs: &mut Subscribers<T>, command: &str) -> mpsc::UnboundedReceiver<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    subs.entry(command.to_string()).or_default().push(tx);
    rx
}

#[derive(Default)]
struct PeerSlot {
    broadcasts: Subscribers<Args>,
    counts: Vec<mpsc::UnboundedSender<usize>>,
}

struct HostedService {
    host: PeerIdentity,
    handler: Arc<dyn RequestHandler>,
    /// Notifications from guests, heard by the host.
    to_host: Subscribers<Value>,
    /// Notifications from the host, heard by each guest.
    to_guests: HashMap<PeerIdentity, Subscribers<Value>>,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<PeerIdentity, PeerSlot>,
    services: HashMap<String, HostedService>,
}

impl HubState {
    fn announce_count(&mut self) {
        let others = self.peers.len().saturating_sub(1);
        for slot in self.peers.values_mut() {
            slot.counts.retain(|tx| tx.send(others).is_ok());
        }
    }
}

/// A collaboration session whose peers all live in this process.
#[derive(Clone, Default)]
pub struct LocalSession {
    state: Arc<Mutex<HubState>>,
}

impl LocalSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join with a fresh identity.
    #[must_use]
    pub fn join(&self) -> Arc<LocalPeer> {
        let identity = PeerIdentity::generate();
        let mut state = self.lock();
        state.peers.insert(identity, PeerSlot::default());
        state.announce_count();
        let total = state.peers.len();
        drop(state);
        tracing::debug!(peer = %identity, total, "peer joined");
        Arc::new(LocalPeer {
            identity,
            session: self.clone(),
            left: AtomicBool::new(false),
        })
    }

    /// Peers currently joined.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One peer's handle on a `LocalSession`. Leaves on drop.
pub struct LocalPeer {
    identity: PeerIdentity,
    session: LocalSession,
    left: AtomicBool,
}

impl LocalPeer {
    #[must_use]
    pub const fn identity(&self) -> PeerIdentity {
        self.identity
    }

    /// Leave the session.
    ///
    /// Services this peer hosts are withdrawn, and every subscription it
    /// holds is closed. Idempotent.
    pub fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.session.lock();
        state.peers.remove(&self.identity);
        state.services.retain(|name, service| {
            let keep = service.host != self.identity;
            if !keep {
                tracing::info!(service = %name, "host left; service withdrawn");
            }
            keep
        });
        for service in state.services.values_mut() {
            service.to_guests.remove(&self.identity);
        }
        state.announce_count();
        let remaining = state.peers.len();
        drop(state);
        tracing::debug!(peer = %self.identity, remaining, "peer left");
    }

    fn ensure_joined(&self) -> Result<(), ChannelError> {
        if self.left.load(Ordering::SeqCst) {
            Err(ChannelError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for LocalPeer {
    fn drop(&mut self) {
        self.leave();
    }
}

impl PeerChannel for LocalPeer {
    fn peer_count(&self) -> usize {
        self.session.len().saturating_sub(1)
    }

    fn watch_peer_count(&self) -> mpsc::UnboundedReceiver<usize> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(slot) = self.session.lock().peers.get_mut(&self.identity) {
            slot.counts.push(tx);
        }
        rx
    }

    fn broadcast(&self, command: &str, args: Args) -> Result<(), ChannelError> {
        self.ensure_joined()?;
        let mut state = self.session.lock();
        for slot in state.peers.values_mut() {
            publish(&mut slot.broadcasts, command, &args);
        }
        Ok(())
    }

    fn on_broadcast(&self, command: &str) -> mpsc::UnboundedReceiver<Args> {
        let mut state = self.session.lock();
        match state.peers.get_mut(&self.identity) {
            Some(slot) => subscribe(&mut slot.broadcasts, command),
            // Already left: hand back a closed receiver.
            None => mpsc::unbounded_channel().1,
        }
    }

    fn shared_service(&self, name: &str) -> Option<Arc<dyn SharedService>> {
        let state = self.session.lock();
        let service = state.services.get(name)?;
        if service.host == self.identity {
            return None;
        }
        Some(Arc::new(ServiceEndpoint {
            session: self.session.clone(),
            name: name.to_string(),
            peer: self.identity,
            hosting: false,
        }))
    }

    fn share_service(
        &self,
        name: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn SharedService>, ChannelError> {
        self.ensure_joined()?;
        let mut state = self.session.lock();
        if state.services.contains_key(name) {
            return Err(ChannelError::AlreadyShared(name.to_string()));
        }
        state.services.insert(
            name.to_string(),
            HostedService {
                host: self.identity,
                handler,
                to_host: HashMap::new(),
                to_guests: HashMap::new(),
            },
        );
        drop(state);
        tracing::info!(service = %name, host = %self.identity, "service shared");
        Ok(Arc::new(ServiceEndpoint {
            session: self.session.clone(),
            name: name.to_string(),
            peer: self.identity,
            hosting: true,
        }))
    }
}

/// A peer's end of a hosted service.
struct ServiceEndpoint {
    session: LocalSession,
    name: String,
    peer: PeerIdentity,
    hosting: bool,
}

impl ServiceEndpoint {
    fn unavailable(&self) -> ChannelError {
        ChannelError::ServiceUnavailable(self.name.clone())
    }
}

#[async_trait]
impl SharedService for ServiceEndpoint {
    async fn request(&self, command: &str, args: Args) -> Result<Value, ChannelError> {
        let handler = {
            let state = self.session.lock();
            let service = state.services.get(&self.name).ok_or_else(|| self.unavailable())?;
            Arc::clone(&service.handler)
        };
        handler.handle(command, args).await
    }

    fn notify(&self, command: &str, payload: Value) {
        let mut state = self.session.lock();
        let Some(service) = state.services.get_mut(&self.name) else {
            tracing::trace!(service = %self.name, command, "notify to withdrawn service dropped");
            return;
        };
        if self.hosting {
            for subs in service.to_guests.values_mut() {
                publish(subs, command, &payload);
            }
        } else {
            publish(&mut service.to_host, command, &payload);
        }
    }

    fn on_notify(&self, command: &str) -> mpsc::UnboundedReceiver<Value> {
        let mut state = self.session.lock();
        let Some(service) = state.services.get_mut(&self.name) else {
            return mpsc::unbounded_channel().1;
        };
        if self.hosting {
            subscribe(&mut service.to_host, command)
        } else {
            subscribe(service.to_guests.entry(self.peer).or_default(), command)
        }
    }
}
