//! Routing of streamed response envelopes to the calls that asked for them.
//!
//! The channel has no call correlation of its own, so every envelope
//! carries the `CallTag` of its call. Envelopes that arrive before their
//! call is registered wait in a bounded FIFO; completed tags are remembered
//! for a while so replayed or duplicated envelopes are dropped.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    task::{Context, Poll, ready},
};

use futures::{Stream, StreamExt};
use peer_sync_core::{CallTag, ResponseEnvelope, ResponseKind, SyncConfig};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::ProxyError;

/// Lifecycle of one streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Registered, nothing received yet.
    Sent,
    /// At least one envelope received.
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl CallState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

enum StreamEvent {
    Progress(Option<Value>),
    Finished,
    Failed(ProxyError),
}

struct PendingCall {
    registration: u64,
    /// Lowest sequence number not yet delivered.
    next_seq: u64,
    sink: mpsc::UnboundedSender<StreamEvent>,
}

struct State {
    pending: HashMap<CallTag, PendingCall>,
    unmatched: VecDeque<ResponseEnvelope>,
    retired: VecDeque<CallTag>,
    retired_set: HashSet<CallTag>,
    next_registration: u64,
    disposed: bool,
    buffer_capacity: usize,
    retired_capacity: usize,
}

impl State {
    fn deliver(&mut self, tag: &CallTag, envelope: ResponseEnvelope) {
        if let (Some(seq), Some(call)) = (envelope.seq, self.pending.get_mut(tag)) {
            if seq < call.next_seq {
                tracing::trace!(?tag, seq, "dropping envelope already delivered");
                return;
            }
            call.next_seq = seq.saturating_add(1);
        }
        let terminal = envelope.kind.is_terminal();
        let event = match envelope.kind {
            ResponseKind::Start | ResponseKind::Update => {
                let payload = envelope.payload;
                StreamEvent::Progress((!payload.is_null()).then_some(payload))
            }
            ResponseKind::Finish => StreamEvent::Finished,
            ResponseKind::Error => StreamEvent::Failed(ProxyError::Remote(envelope.error_message())),
        };
        self.send(tag, event, terminal);
    }

    fn send(&mut self, tag: &CallTag, event: StreamEvent, terminal: bool) {
        let Some(call) = self.pending.get(tag) else {
            return;
        };
        let delivered = call.sink.send(event).is_ok();
        if terminal || !delivered {
            self.pending.remove(tag);
            self.retire(tag.clone());
        }
    }

    fn buffer(&mut self, envelope: ResponseEnvelope) {
        if self.buffer_capacity == 0 {
            return;
        }
        while self.unmatched.len() >= self.buffer_capacity {
            if let Some(evicted) = self.unmatched.pop_front() {
                tracing::debug!(tag = ?evicted.tag, "evicting unmatched envelope");
            }
        }
        self.unmatched.push_back(envelope);
    }

    fn retire(&mut self, tag: CallTag) {
        if self.retired_capacity == 0 || !self.retired_set.insert(tag.clone()) {
            return;
        }
        self.retired.push_back(tag);
        while self.retired.len() > self.retired_capacity {
            if let Some(oldest) = self.retired.pop_front() {
                self.retired_set.remove(&oldest);
            }
        }
    }

    fn unretire(&mut self, tag: &CallTag) {
        if self.retired_set.remove(tag) {
            self.retired.retain(|t| t != tag);
        }
    }

    fn deregister(&mut self, tag: &CallTag, registration: u64) {
        if self
            .pending
            .get(tag)
            .is_some_and(|call| call.registration == registration)
        {
            self.pending.remove(tag);
            self.retire(tag.clone());
        }
    }
}

/// Matches tagged envelopes to the in-flight calls of the local peer.
///
/// Cheap to clone; clones share the same pending set.
#[derive(Clone)]
pub struct ResponseCorrelator {
    state: Arc<Mutex<State>>,
}

impl ResponseCorrelator {
    /// Create a correlator with explicit bounds.
    #[must_use]
    pub fn new(buffer_capacity: usize, retired_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                pending: HashMap::new(),
                unmatched: VecDeque::new(),
                retired: VecDeque::new(),
                retired_set: HashSet::new(),
                next_registration: 0,
                disposed: false,
                buffer_capacity,
                retired_capacity,
            })),
        }
    }

    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.envelope_buffer_capacity, config.retired_call_capacity)
    }

    /// Register interest in `tag`.
    ///
    /// Envelopes already buffered for the tag are replayed into the returned
    /// stream in arrival order.
    #[must_use]
    pub fn register(&self, tag: CallTag) -> ResponseStream {
        let (sink, events) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let registration = state.next_registration;
        state.next_registration += 1;

        let stream = ResponseStream {
            tag: tag.clone(),
            registration,
            events: UnboundedReceiverStream::new(events),
            owner: Arc::downgrade(&self.state),
            state: CallState::Sent,
        };
        if state.disposed {
            return stream;
        }

        state.unretire(&tag);
        if state
            .pending
            .insert(
                tag.clone(),
                PendingCall {
                    registration,
                    next_seq: 0,
                    sink,
                },
            )
            .is_some()
        {
            tracing::warn!(?tag, "call registered twice; orphaning the earlier one");
        }

        let (matched, rest): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.unmatched)
            .into_iter()
            .partition(|env| env.tag.as_ref() == Some(&tag));
        state.unmatched = rest;
        for envelope in matched {
            state.deliver(&tag, envelope);
        }
        stream
    }

    /// Route one arriving envelope.
    pub fn ingest(&self, envelope: ResponseEnvelope) {
        let Some(tag) = envelope.tag.clone() else {
            tracing::debug!(kind = ?envelope.kind, "dropping untagged envelope");
            return;
        };
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        if state.retired_set.contains(&tag) {
            tracing::trace!(?tag, kind = ?envelope.kind, "dropping envelope for finished call");
            return;
        }
        if state.pending.contains_key(&tag) {
            state.deliver(&tag, envelope);
        } else {
            state.buffer(envelope);
        }
    }

    /// Fail a pending call locally, e.g. when its request never left.
    pub fn fail(&self, tag: &CallTag, error: ProxyError) {
        self.lock().send(tag, StreamEvent::Failed(error), true);
    }

    /// Fail every pending call, e.g. when the host went away.
    pub fn fail_all(&self, error: &ProxyError) {
        let mut state = self.lock();
        let tags: Vec<_> = state.pending.keys().cloned().collect();
        for tag in tags {
            state.send(&tag, StreamEvent::Failed(error.clone()), true);
        }
    }

    /// Number of registered calls still waiting for a terminal envelope.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of envelopes waiting for a registration.
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.lock().unmatched.len()
    }

    /// Drop every pending call and buffered envelope.
    ///
    /// Pending streams end with `OrphanedCall`, as does every stream
    /// registered afterwards.
    pub fn dispose(&self) {
        let mut state = self.lock();
        state.disposed = true;
        state.pending.clear();
        state.unmatched.clear();
        state.retired.clear();
        state.retired_set.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Values of one streaming call, ending on `finish` (clean end) or with a
/// single error item.
///
/// Dropping the stream before it ends deregisters the call.
pub struct ResponseStream {
    tag: CallTag,
    registration: u64,
    events: UnboundedReceiverStream<StreamEvent>,
    owner: Weak<Mutex<State>>,
    state: CallState,
}

impl ResponseStream {
    #[must_use]
    pub const fn tag(&self) -> &CallTag {
        &self.tag
    }

    #[must_use]
    pub const fn state(&self) -> CallState {
        self.state
    }

    /// Stop waiting for this call. Envelopes arriving later are dropped.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.deregister();
        self.state = CallState::Cancelled;
    }

    /// Consume the call and return its last value.
    ///
    /// # Errors
    /// Returns `Cancelled` if `cancel` fires first, otherwise the call's own
    /// failure.
    pub async fn aggregate(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, ProxyError> {
        let mut last = None;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = self.next() => Some(next),
            };
            match next {
                None => {
                    self.cancel();
                    return Err(ProxyError::Cancelled);
                }
                Some(Some(Ok(value))) => last = Some(value),
                Some(Some(Err(e))) => return Err(e),
                Some(None) => return Ok(last),
            }
        }
    }

    fn deregister(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .deregister(&self.tag, self.registration);
        }
    }
}

impl Stream for ResponseStream {
    type Item = Result<Value, ProxyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.state.is_terminal() {
            return Poll::Ready(None);
        }
        loop {
            match ready!(this.events.poll_next_unpin(cx)) {
                Some(StreamEvent::Progress(value)) => {
                    this.state = CallState::Streaming;
                    if let Some(value) = value {
                        return Poll::Ready(Some(Ok(value)));
                    }
                }
                Some(StreamEvent::Finished) => {
                    this.state = CallState::Completed;
                    return Poll::Ready(None);
                }
                Some(StreamEvent::Failed(e)) => {
                    this.state = CallState::Failed;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.state = CallState::Failed;
                    return Poll::Ready(Some(Err(ProxyError::OrphanedCall)));
                }
            }
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.deregister();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    fn tag(id: &str) -> CallTag {
        CallTag::new("x=1", "a.py", 0, id)
    }

    fn env(kind: ResponseKind, tag: &CallTag, payload: Value) -> ResponseEnvelope {
        ResponseEnvelope::now(kind, tag.clone(), payload)
    }

    fn correlator() -> ResponseCorrelator {
        ResponseCorrelator::new(16, 16)
    }

    #[tokio::test]
    async fn test_updates_then_clean_finish() {
        let c = correlator();
        let t = tag("id1");
        let mut stream = c.register(t.clone());

        c.ingest(env(ResponseKind::Start, &t, json!(1)));
        c.ingest(env(ResponseKind::Update, &t, json!(2)));
        c.ingest(env(ResponseKind::Update, &t, json!(3)));
        c.ingest(env(ResponseKind::Finish, &t, Value::Null));

        let values: Vec<_> = (&mut stream).collect().await;
        assert_eq!(values, vec![Ok(json!(1)), Ok(json!(2)), Ok(json!(3))]);
        assert_eq!(stream.state(), CallState::Completed);
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_ends_with_failure() {
        let c = correlator();
        let t = tag("id1");
        let mut stream = c.register(t.clone());

        c.ingest(env(ResponseKind::Start, &t, json!("partial")));
        c.ingest(env(ResponseKind::Error, &t, json!("kernel died")));

        assert_eq!(stream.next().await, Some(Ok(json!("partial"))));
        assert_eq!(
            stream.next().await,
            Some(Err(ProxyError::Remote("kernel died".into())))
        );
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.state(), CallState::Failed);
    }

    #[tokio::test]
    async fn test_early_envelopes_replay_on_register() {
        let c = correlator();
        let t = tag("early");
        let other = tag("other");

        c.ingest(env(ResponseKind::Start, &t, Value::Null));
        c.ingest(env(ResponseKind::Update, &other, json!("not mine")));
        c.ingest(env(ResponseKind::Update, &t, json!({"x": 1})));
        c.ingest(env(ResponseKind::Update, &t, json!({"x": 2})));
        c.ingest(env(ResponseKind::Finish, &t, Value::Null));
        assert_eq!(c.buffered_count(), 5);

        let values: Vec<_> = c.register(t).collect().await;

        assert_eq!(values, vec![Ok(json!({"x": 1})), Ok(json!({"x": 2}))]);
        assert_eq!(c.buffered_count(), 1);
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_finish_is_noop() {
        let c = correlator();
        let t = tag("id1");
        let stream = c.register(t.clone());
        c.ingest(env(ResponseKind::Finish, &t, Value::Null));
        let values: Vec<_> = stream.collect().await;
        assert!(values.is_empty());

        c.ingest(env(ResponseKind::Finish, &t, Value::Null));
        c.ingest(env(ResponseKind::Update, &t, json!("replayed")));

        assert_eq!(c.buffered_count(), 0);
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_interleaved_calls_route_by_tag() {
        let c = correlator();
        let (a, b) = (tag("a"), tag("b"));
        let stream_a = c.register(a.clone());
        let stream_b = c.register(b.clone());

        c.ingest(env(ResponseKind::Update, &b, json!("b1")));
        c.ingest(env(ResponseKind::Update, &a, json!("a1")));
        c.ingest(env(ResponseKind::Update, &b, json!("b2")));
        c.ingest(env(ResponseKind::Finish, &a, Value::Null));
        c.ingest(env(ResponseKind::Finish, &b, Value::Null));

        let a_values: Vec<_> = stream_a.collect().await;
        let b_values: Vec<_> = stream_b.collect().await;
        assert_eq!(a_values, vec![Ok(json!("a1"))]);
        assert_eq!(b_values, vec![Ok(json!("b1")), Ok(json!("b2"))]);
    }

    #[test]
    fn test_state_machine_transitions() {
        let c = correlator();
        let t = tag("id1");
        let mut stream = task::spawn(c.register(t.clone()));
        assert_eq!(stream.state(), CallState::Sent);

        assert_pending!(stream.poll_next());
        c.ingest(env(ResponseKind::Start, &t, Value::Null));
        assert_pending!(stream.poll_next());
        assert_eq!(stream.state(), CallState::Streaming);

        c.ingest(env(ResponseKind::Finish, &t, Value::Null));
        assert!(assert_ready!(stream.poll_next()).is_none());
        assert_eq!(stream.state(), CallState::Completed);
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let c = ResponseCorrelator::new(2, 16);
        let (first, second, third) = (tag("1"), tag("2"), tag("3"));
        c.ingest(env(ResponseKind::Finish, &first, Value::Null));
        c.ingest(env(ResponseKind::Finish, &second, Value::Null));
        c.ingest(env(ResponseKind::Finish, &third, Value::Null));
        assert_eq!(c.buffered_count(), 2);

        let evicted = c.register(first);
        assert_eq!(evicted.state(), CallState::Sent);
        assert_eq!(c.pending_count(), 1);

        let kept = c.register(second);
        drop(kept);
        assert_eq!(c.buffered_count(), 1);
    }

    #[test]
    fn test_untagged_envelope_dropped() {
        let c = correlator();
        c.ingest(ResponseEnvelope {
            kind: ResponseKind::Update,
            tag: None,
            payload: json!(1),
            time: 0,
            seq: None,
        });
        assert_eq!(c.buffered_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_sequence_numbers_are_dropped() {
        let c = correlator();
        let t = tag("id1");
        let mut stream = c.register(t.clone());

        c.ingest(env(ResponseKind::Start, &t, Value::Null).with_seq(0));
        c.ingest(env(ResponseKind::Update, &t, json!(1)).with_seq(1));
        // Catch-up replay for another guest repeats the call so far.
        c.ingest(env(ResponseKind::Start, &t, Value::Null).with_seq(0));
        c.ingest(env(ResponseKind::Update, &t, json!(1)).with_seq(1));
        c.ingest(env(ResponseKind::Update, &t, json!(2)).with_seq(2));
        c.ingest(env(ResponseKind::Finish, &t, Value::Null).with_seq(3));

        let values: Vec<_> = (&mut stream).collect().await;
        assert_eq!(values, vec![Ok(json!(1)), Ok(json!(2))]);
        assert_eq!(stream.state(), CallState::Completed);
    }

    #[tokio::test]
    async fn test_buffered_duplicates_are_dropped_on_register() {
        let c = correlator();
        let t = tag("id1");
        c.ingest(env(ResponseKind::Update, &t, json!(1)).with_seq(1));
        c.ingest(env(ResponseKind::Update, &t, json!(1)).with_seq(1));
        c.ingest(env(ResponseKind::Finish, &t, Value::Null).with_seq(2));

        let values: Vec<_> = c.register(t).collect().await;

        assert_eq!(values, vec![Ok(json!(1))]);
    }

    #[tokio::test]
    async fn test_fail_all_ends_every_pending_call() {
        let c = correlator();
        let mut first = c.register(tag("a"));
        let mut second = c.register(tag("b"));
        c.ingest(env(ResponseKind::Update, &tag("a"), json!(1)));

        c.fail_all(&ProxyError::ServiceUnavailable("svc".into()));

        assert_eq!(first.next().await, Some(Ok(json!(1))));
        assert_eq!(
            first.next().await,
            Some(Err(ProxyError::ServiceUnavailable("svc".into())))
        );
        assert_eq!(
            second.next().await,
            Some(Err(ProxyError::ServiceUnavailable("svc".into())))
        );
        assert_eq!(first.state(), CallState::Failed);
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dispose_orphans_pending_and_future_calls() {
        let c = correlator();
        let mut pending = c.register(tag("pending"));

        c.dispose();

        assert_eq!(pending.next().await, Some(Err(ProxyError::OrphanedCall)));
        assert_eq!(pending.next().await, None);

        let mut late = c.register(tag("late"));
        assert_eq!(late.next().await, Some(Err(ProxyError::OrphanedCall)));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_stream_deregisters() {
        let c = correlator();
        let t = tag("id1");
        drop(c.register(t.clone()));

        assert_eq!(c.pending_count(), 0);
        c.ingest(env(ResponseKind::Update, &t, json!("late")));
        assert_eq!(c.buffered_count(), 0);
    }

    #[tokio::test]
    async fn test_reregistering_retired_tag_starts_new_call() {
        let c = correlator();
        let t = tag("id1");
        let first = c.register(t.clone());
        c.ingest(env(ResponseKind::Finish, &t, Value::Null));
        let _: Vec<_> = first.collect().await;

        let second = c.register(t.clone());
        c.ingest(env(ResponseKind::Update, &t, json!("again")));
        c.ingest(env(ResponseKind::Finish, &t, Value::Null));

        let values: Vec<_> = second.collect().await;
        assert_eq!(values, vec![Ok(json!("again"))]);
    }

    #[tokio::test]
    async fn test_aggregate_returns_last_value() {
        let c = correlator();
        let t = tag("id1");
        let stream = c.register(t.clone());
        c.ingest(env(ResponseKind::Update, &t, json!(1)));
        c.ingest(env(ResponseKind::Update, &t, json!(2)));
        c.ingest(env(ResponseKind::Finish, &t, Value::Null));

        let last = stream.aggregate(&CancellationToken::new()).await.unwrap();
        assert_eq!(last, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_aggregate_cancellation() {
        let c = correlator();
        let t = tag("id1");
        let stream = c.register(t.clone());
        c.ingest(env(ResponseKind::Update, &t, json!(1)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = stream.aggregate(&cancel).await.unwrap_err();

        assert_eq!(err, ProxyError::Cancelled);
        assert_eq!(c.pending_count(), 0);
        c.ingest(env(ResponseKind::Finish, &t, Value::Null));
        assert_eq!(c.buffered_count(), 0);
    }

    #[tokio::test]
    async fn test_local_failure() {
        let c = correlator();
        let t = tag("id1");
        let mut stream = c.register(t.clone());

        c.fail(&t, ProxyError::ServiceUnavailable("svc".into()));

        assert_eq!(
            stream.next().await,
            Some(Err(ProxyError::ServiceUnavailable("svc".into())))
        );
        assert_eq!(stream.state(), CallState::Failed);
    }
}
