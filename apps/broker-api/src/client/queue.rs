//! Per-endpoint outbound queue of one client identity.
//!
//! Pushes pass through the queue's throttle before they land. Messages the
//! throttle defers (buffer or conflate) wait in a side list and are released
//! on a later drain once the subscriber's rate allows.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::message::Message;
use crate::messaging::throttle::{OutboundQueueThrottle, ThrottleResult, ThrottleSettings};

#[derive(Debug, Clone)]
struct Queued {
    subscriber_id: String,
    message: Message,
}

/// What happened to a pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Ready,
    Deferred,
    Dropped,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Queued>,
    deferred: VecDeque<Queued>,
    throttle: OutboundQueueThrottle,
    closed: bool,
}

pub struct EndpointQueue {
    client_id: String,
    endpoint_id: String,
    state: Mutex<QueueState>,
    signal: Notify,
}

impl EndpointQueue {
    pub fn new(client_id: impl Into<String>, endpoint_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            endpoint_id: endpoint_id.into(),
            state: Mutex::new(QueueState::default()),
            signal: Notify::new(),
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn register_subscriber(
        &self,
        subscriber_id: &str,
        tuple: &str,
        settings: &ThrottleSettings,
        max_frequency: u32,
    ) -> bool {
        self.state
            .lock()
            .throttle
            .register(subscriber_id, tuple, settings, max_frequency)
    }

    pub fn unregister_subscriber(&self, subscriber_id: &str, tuple: &str) {
        self.state.lock().throttle.unregister(subscriber_id, tuple);
    }

    /// Forget every throttle mark and deferred message of a subscriber.
    pub fn remove_subscriber(&self, subscriber_id: &str) {
        let mut state = self.state.lock();
        state.throttle.remove(subscriber_id);
        state.deferred.retain(|q| q.subscriber_id != subscriber_id);
    }

    /// Throttle and enqueue a message addressed to `subscriber_id`.
    pub fn push(&self, subscriber_id: &str, message: Message, now_ms: i64) -> Enqueued {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Enqueued::Dropped;
            }
            let queued = Queued {
                subscriber_id: subscriber_id.to_string(),
                message,
            };
            match state.throttle.throttle(subscriber_id, now_ms) {
                ThrottleResult::Ok => {
                    state.ready.push_back(queued);
                    Enqueued::Ready
                }
                ThrottleResult::Rejected(policy) => {
                    tracing::debug!(
                        client_id = %self.client_id,
                        subscriber_id,
                        ?policy,
                        "outbound message dropped by client frequency"
                    );
                    Enqueued::Dropped
                }
                ThrottleResult::Buffer => {
                    let capacity = state.throttle.buffer_capacity(subscriber_id).max(1);
                    let held = state
                        .deferred
                        .iter()
                        .filter(|q| q.subscriber_id == subscriber_id)
                        .count();
                    if held >= capacity {
                        if let Some(pos) = state
                            .deferred
                            .iter()
                            .position(|q| q.subscriber_id == subscriber_id)
                        {
                            state.deferred.remove(pos);
                        }
                    }
                    state.deferred.push_back(queued);
                    Enqueued::Deferred
                }
                ThrottleResult::Conflate => {
                    match state
                        .deferred
                        .iter_mut()
                        .find(|q| q.subscriber_id == subscriber_id)
                    {
                        Some(slot) => *slot = queued,
                        None => state.deferred.push_back(queued),
                    }
                    Enqueued::Deferred
                }
            }
        };
        if outcome == Enqueued::Ready {
            self.signal.notify_one();
        }
        outcome
    }

    /// Take everything deliverable at `now_ms`. Deferred messages are released
    /// first in arrival order while their subscriber's rate allows; expired
    /// messages are discarded.
    pub fn drain(&self, now_ms: i64) -> Vec<Message> {
        self.drain_where(now_ms, |_| true)
    }

    /// Like [`drain`](Self::drain), but only messages accepted by `take` leave
    /// the queue; the rest stay ready for a later drain.
    pub fn drain_where(&self, now_ms: i64, take: impl Fn(&Message) -> bool) -> Vec<Message> {
        let mut state = self.state.lock();
        let QueueState {
            ready,
            deferred,
            throttle,
            ..
        } = &mut *state;

        let mut held = VecDeque::with_capacity(deferred.len());
        while let Some(q) = deferred.pop_front() {
            if throttle.throttle(&q.subscriber_id, now_ms) == ThrottleResult::Ok {
                ready.push_back(q);
            } else {
                held.push_back(q);
            }
        }
        *deferred = held;

        let mut taken = Vec::new();
        let mut kept = VecDeque::new();
        for q in ready.drain(..) {
            if q.message.is_expired(now_ms) {
                continue;
            }
            if take(&q.message) {
                taken.push(q.message);
            } else {
                kept.push_back(q);
            }
        }
        *ready = kept;
        taken
    }

    pub fn has_ready(&self) -> bool {
        !self.state.lock().ready.is_empty()
    }

    pub fn has_deferred(&self) -> bool {
        !self.state.lock().deferred.is_empty()
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after the next ready push (or immediately if one happened
    /// since the last wait).
    pub async fn ready(&self) {
        self.signal.notified().await;
    }

    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.ready.clear();
            state.deferred.clear();
        }
        self.signal.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::throttle::ThrottlePolicy;
    use serde_json::json;

    fn throttled(policy: ThrottlePolicy, client: u32) -> ThrottleSettings {
        ThrottleSettings {
            outbound_policy: policy,
            max_outgoing_client_frequency: client,
            ..Default::default()
        }
    }

    fn msg(n: i64) -> Message {
        Message::data("quotes", json!({ "n": n }))
    }

    #[test]
    fn unthrottled_messages_are_ready_in_order() {
        let q = EndpointQueue::new("c", "poll");
        for n in 0..3 {
            assert_eq!(q.push("c", msg(n), 0), Enqueued::Ready);
        }
        let out: Vec<_> = q.drain(0).into_iter().map(|m| m.body["n"].clone()).collect();
        assert_eq!(out, vec![json!(0), json!(1), json!(2)]);
        assert!(q.is_empty());
    }

    #[test]
    fn ignore_policy_bounds_burst() {
        let q = EndpointQueue::new("c", "poll");
        q.register_subscriber("c", "", &throttled(ThrottlePolicy::Ignore, 5), 0);
        let ready = (0..10)
            .filter(|n| q.push("c", msg(*n), 1_000) == Enqueued::Ready)
            .count();
        assert_eq!(ready, 5);
        assert_eq!(q.drain(1_000).len(), 5);
    }

    #[test]
    fn conflate_keeps_latest_deferred() {
        let q = EndpointQueue::new("c", "poll");
        q.register_subscriber("c", "", &throttled(ThrottlePolicy::Conflate, 1), 0);
        assert_eq!(q.push("c", msg(0), 0), Enqueued::Ready);
        assert_eq!(q.push("c", msg(1), 0), Enqueued::Deferred);
        assert_eq!(q.push("c", msg(2), 0), Enqueued::Deferred);
        assert_eq!(q.len(), 2);

        assert_eq!(q.drain(0).len(), 1);
        let later = q.drain(5_000);
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].body["n"], json!(2));
    }

    #[test]
    fn buffer_is_capped_by_frequency() {
        let q = EndpointQueue::new("c", "poll");
        q.register_subscriber("c", "", &throttled(ThrottlePolicy::Buffer, 2), 0);
        for n in 0..10 {
            q.push("c", msg(n), 0);
        }
        // Two admitted plus at most two held back.
        assert!(q.len() <= 4);
    }

    #[test]
    fn drain_where_leaves_other_messages_ready() {
        let q = EndpointQueue::new("c", "poll");
        q.push("c", msg(0), 0);
        q.push("c", Message::data("news", json!({ "n": 1 })), 0);
        let quotes = q.drain_where(0, |m| m.destination.as_deref() == Some("quotes"));
        assert_eq!(quotes.len(), 1);
        assert!(q.has_ready());
        assert_eq!(q.drain(0)[0].destination.as_deref(), Some("news"));
    }

    #[test]
    fn closed_queue_drops() {
        let q = EndpointQueue::new("c", "poll");
        q.push("c", msg(0), 0);
        q.close();
        assert!(q.is_empty());
        assert_eq!(q.push("c", msg(1), 0), Enqueued::Dropped);
    }

    #[tokio::test]
    async fn push_wakes_waiter() {
        let q = std::sync::Arc::new(EndpointQueue::new("c", "poll"));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.ready().await })
        };
        tokio::task::yield_now().await;
        q.push("c", msg(0), 0);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
