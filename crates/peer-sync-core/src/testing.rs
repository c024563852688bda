//! Recording channel doubles (feature `testing`).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::channel::{Args, ChannelError, PeerChannel, RequestHandler, SharedService};

type Subscribers<T> = Mutex<HashMap<String, Vec<mpsc::UnboundedSender<T>>>>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn publish<T: Clone>(subs: &Subscribers<T>, command: &str, value: &T) {
    if let Some(list) = lock(subs).get_mut(command) {
        list.retain(|tx| tx.send(value.clone()).is_ok());
    }
}

/// Channel that records outbound traffic and lets tests inject inbound.
#[derive(Default)]
pub struct RecordingChannel {
    peers: Mutex<usize>,
    sent: Mutex<Vec<(String, Args)>>,
    broadcast_subs: Subscribers<Args>,
    count_subs: Mutex<Vec<mpsc::UnboundedSender<usize>>>,
    service: Mutex<Option<Arc<RecordingService>>>,
}

impl RecordingChannel {
    #[must_use]
    pub fn new(peers: usize) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(peers),
            ..Self::default()
        })
    }

    /// Make `service` resolvable through `shared_service`.
    pub fn provide_service(&self, service: Arc<RecordingService>) {
        *lock(&self.service) = Some(service);
    }

    /// The service provided or shared on this channel.
    #[must_use]
    pub fn service(&self) -> Option<Arc<RecordingService>> {
        lock(&self.service).clone()
    }

    /// Change the peer count and notify watchers.
    pub fn set_peer_count(&self, count: usize) {
        *lock(&self.peers) = count;
        lock(&self.count_subs).retain(|tx| tx.send(count).is_ok());
    }

    /// Deliver a broadcast as if another peer had sent it.
    pub fn deliver(&self, command: &str, args: Args) {
        publish(&self.broadcast_subs, command, &args);
    }

    /// Everything broadcast so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(String, Args)> {
        lock(&self.sent).clone()
    }

    /// Broadcasts of one command.
    #[must_use]
    pub fn sent_of(&self, command: &str) -> Vec<Args> {
        lock(&self.sent)
            .iter()
            .filter(|(c, _)| c == command)
            .map(|(_, a)| a.clone())
            .collect()
    }
}

impl PeerChannel for RecordingChannel {
    fn peer_count(&self) -> usize {
        *lock(&self.peers)
    }

    fn watch_peer_count(&self) -> mpsc::UnboundedReceiver<usize> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.count_subs).push(tx);
        rx
    }

    fn broadcast(&self, command: &str, args: Args) -> Result<(), ChannelError> {
        lock(&self.sent).push((command.to_string(), args));
        Ok(())
    }

    fn on_broadcast(&self, command: &str) -> mpsc::UnboundedReceiver<Args> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.broadcast_subs)
            .entry(command.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn shared_service(&self, _name: &str) -> Option<Arc<dyn SharedService>> {
        lock(&self.service)
            .clone()
            .map(|s| s as Arc<dyn SharedService>)
    }

    fn share_service(
        &self,
        name: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn SharedService>, ChannelError> {
        let mut slot = lock(&self.service);
        if slot.is_some() {
            return Err(ChannelError::AlreadyShared(name.to_string()));
        }
        let service = RecordingService::new();
        *lock(&service.handler) = Some(handler);
        *slot = Some(Arc::clone(&service));
        Ok(service)
    }
}

/// Shared service double with canned replies.
///
/// Requests go to a registered handler if there is one, otherwise to the
/// canned reply for the command.
#[derive(Default)]
pub struct RecordingService {
    replies: Mutex<HashMap<String, Result<Value, ChannelError>>>,
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    requests: Mutex<Vec<(String, Args)>>,
    notifications: Mutex<Vec<(String, Value)>>,
    notify_subs: Subscribers<Value>,
}

impl RecordingService {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `command` with `reply`.
    pub fn reply(&self, command: &str, reply: Result<Value, ChannelError>) {
        lock(&self.replies).insert(command.to_string(), reply);
    }

    /// Deliver a notification as if the other side had sent it.
    pub fn emit(&self, command: &str, payload: Value) {
        publish(&self.notify_subs, command, &payload);
    }

    /// Close every notify subscription, as a departing host would.
    pub fn close_notifications(&self) {
        lock(&self.notify_subs).clear();
    }

    #[must_use]
    pub fn requests(&self) -> Vec<(String, Args)> {
        lock(&self.requests).clone()
    }

    #[must_use]
    pub fn notifications(&self) -> Vec<(String, Value)> {
        lock(&self.notifications).clone()
    }

    /// Notifications of one command.
    #[must_use]
    pub fn notifications_of(&self, command: &str) -> Vec<Value> {
        lock(&self.notifications)
            .iter()
            .filter(|(c, _)| c == command)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl SharedService for RecordingService {
    async fn request(&self, command: &str, args: Args) -> Result<Value, ChannelError> {
        lock(&self.requests).push((command.to_string(), args.clone()));
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            return handler.handle(command, args).await;
        }
        lock(&self.replies)
            .get(command)
            .cloned()
            .unwrap_or_else(|| Err(ChannelError::UnknownCommand(command.to_string())))
    }

    fn notify(&self, command: &str, payload: Value) {
        lock(&self.notifications).push((command.to_string(), payload));
    }

    fn on_notify(&self, command: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.notify_subs)
            .entry(command.to_string())
            .or_default()
            .push(tx);
        rx
    }
}
