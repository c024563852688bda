//! Bounded history of emitted envelopes for catch-up replay.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use crate::ResponseEnvelope;

struct StoredEnvelope {
    envelope: ResponseEnvelope,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredEnvelope>,
    total_bytes: usize,
}

/// Envelope history kept by the host.
///
/// Guests that attach late ask for everything emitted since their start
/// time; the oldest entries are evicted once `max_bytes` is exceeded.
pub struct ResponseLog {
    inner: RwLock<Inner>,
    max_bytes: usize,
}

impl ResponseLog {
    /// Create a log bounded to roughly `max_bytes`.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Append an envelope, evicting from the front to stay within bounds.
    pub fn push(&self, envelope: ResponseEnvelope) {
        let bytes = envelope.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.total_bytes.saturating_add(bytes) > self.max_bytes {
            if let Some(front) = inner.history.pop_front() {
                tracing::trace!(time = front.envelope.time, "evicting envelope from response log");
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredEnvelope { envelope, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Envelopes with `time >= since`, in emission order.
    #[must_use]
    pub fn since(&self, since: u64) -> Vec<ResponseEnvelope> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .filter(|s| s.envelope.time >= since)
            .map(|s| s.envelope.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{CallTag, ResponseKind};

    fn envelope(time: u64, payload: serde_json::Value) -> ResponseEnvelope {
        ResponseEnvelope {
            kind: ResponseKind::Update,
            tag: Some(CallTag::new("c", "f", 0, "i")),
            payload,
            time,
            seq: None,
        }
    }

    #[test]
    fn test_since_filters_by_time_in_order() {
        let log = ResponseLog::new(1 << 20);
        log.push(envelope(10, json!(1)));
        log.push(envelope(20, json!(2)));
        log.push(envelope(30, json!(3)));

        let replay: Vec<_> = log.since(20).into_iter().map(|e| e.payload).collect();
        assert_eq!(replay, vec![json!(2), json!(3)]);
        assert_eq!(log.since(0).len(), 3);
        assert!(log.since(31).is_empty());
    }

    #[test]
    fn test_oldest_evicted_past_byte_bound() {
        let one = envelope(1, json!("x")).approx_bytes();
        let log = ResponseLog::new(one * 2);
        log.push(envelope(1, json!("x")));
        log.push(envelope(2, json!("y")));
        log.push(envelope(3, json!("z")));

        assert_eq!(log.len(), 2);
        let times: Vec<_> = log.since(0).into_iter().map(|e| e.time).collect();
        assert_eq!(times, vec![2, 3]);
    }

    #[test]
    fn test_empty_log() {
        let log = ResponseLog::new(1024);
        assert!(log.is_empty());
        assert!(log.since(0).is_empty());
    }
}
