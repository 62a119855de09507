//! Client identities: one logical client spanning any number of sessions,
//! owning its subscriptions and one outbound queue per endpoint.

pub mod queue;
pub mod registry;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broker::MessageBroker;
use crate::error::BrokerError;
use crate::listeners::ListenerList;
use crate::message::Message;
use crate::messaging::subscription::{Subscription, SubscriptionKey};
use crate::messaging::throttle::ThrottleSettings;
use crate::session::Session;
use crate::timeout::{Expirable, TimeoutHandle};

use queue::{EndpointQueue, Enqueued};

/// Upper bound on a single long-poll park while throttled messages are pending release.
const DEFERRED_RECHECK: Duration = Duration::from_millis(100);

pub trait ClientListener: Send + Sync {
    fn client_created(&self, _client: &Arc<ClientIdentity>) {}
    fn client_destroyed(&self, _client: &ClientIdentity) {}
}

struct ClientState {
    valid: bool,
    invalidating: bool,
    session_ids: Vec<String>,
    subscriptions: Vec<SubscriptionKey>,
    queues: HashMap<String, Arc<EndpointQueue>>,
    last_use: Instant,
    timeout: Option<TimeoutHandle>,
}

pub struct ClientIdentity {
    id: String,
    broker: Weak<MessageBroker>,
    /// How long the identity outlives its last session.
    timeout_period: Duration,
    state: Mutex<ClientState>,
    destroyed_listeners: ListenerList<dyn ClientListener>,
    closed: CancellationToken,
}

impl ClientIdentity {
    pub(crate) fn new(id: String, broker: Weak<MessageBroker>, timeout_period: Duration) -> Self {
        Self {
            id,
            broker,
            timeout_period,
            state: Mutex::new(ClientState {
                valid: true,
                invalidating: false,
                session_ids: Vec::new(),
                subscriptions: Vec::new(),
                queues: HashMap::new(),
                last_use: Instant::now(),
                timeout: None,
            }),
            destroyed_listeners: ListenerList::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn touch(&self) {
        self.state.lock().last_use = Instant::now();
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.state.lock().session_ids.clone()
    }

    pub fn subscription_keys(&self) -> Vec<SubscriptionKey> {
        self.state.lock().subscriptions.clone()
    }

    pub fn add_destroyed_listener(&self, listener: Arc<dyn ClientListener>) -> Result<(), BrokerError> {
        if !self.is_valid() {
            return Err(BrokerError::Invalidated("Client"));
        }
        self.destroyed_listeners.add(listener);
        Ok(())
    }

    pub fn remove_destroyed_listener(&self, listener: &Arc<dyn ClientListener>) {
        self.destroyed_listeners.remove(listener);
    }

    // -- sessions -----------------------------------------------------------

    /// Associate with `session` in both directions. Cancels a pending
    /// orphan timeout.
    pub fn register_session(&self, session: &Session) -> Result<(), BrokerError> {
        let pending = {
            let mut state = self.state.lock();
            if !state.valid || state.invalidating {
                return Err(BrokerError::Invalidated("Client"));
            }
            if !state.session_ids.iter().any(|s| s == session.id()) {
                state.session_ids.push(session.id().to_string());
            }
            state.last_use = Instant::now();
            state.timeout.take()
        };
        if let (Some(handle), Some(broker)) = (pending, self.broker.upgrade()) {
            broker.timeouts().cancel(handle);
        }
        session.register_client(&self.id)
    }

    /// Drop the association with a session. When the last session goes the
    /// identity either starts its orphan timeout or, with no timeout
    /// configured, is destroyed immediately.
    pub fn unregister_session(self: &Arc<Self>, session_id: &str) {
        let orphaned = {
            let mut state = self.state.lock();
            let before = state.session_ids.len();
            state.session_ids.retain(|s| s != session_id);
            let removed = state.session_ids.len() != before;
            state.last_use = Instant::now();
            removed && state.session_ids.is_empty() && state.valid && !state.invalidating
        };
        let broker = self.broker.upgrade();
        if let Some(session) = broker.as_ref().and_then(|b| b.sessions().get(session_id)) {
            session.unregister_client(&self.id);
        }
        if !orphaned {
            return;
        }

        match broker {
            Some(broker) if !self.timeout_period.is_zero() => {
                let target: Arc<dyn Expirable> = self.clone();
                broker.timeouts().watch(Arc::downgrade(&target));
                tracing::debug!(client_id = %self.id, "client has no sessions; orphan timeout armed");
            }
            _ => self.invalidate(),
        }
    }

    // -- subscriptions ------------------------------------------------------

    pub(crate) fn register_subscription(&self, subscription: &Subscription) -> Result<(), BrokerError> {
        let key = subscription.key();
        let mut state = self.state.lock();
        if !state.valid || state.invalidating {
            return Err(BrokerError::Invalidated("Client"));
        }
        if !state.subscriptions.contains(&key) {
            state.subscriptions.push(key);
        }
        Ok(())
    }

    pub(crate) fn unregister_subscription(&self, subscription: &Subscription) {
        if let Some(endpoint_id) = subscription.endpoint_id() {
            self.unregister_subscription_from(subscription, &endpoint_id);
        } else {
            let key = subscription.key();
            self.state.lock().subscriptions.retain(|k| k != &key);
        }
    }

    /// Unregister a subscription whose queue lives on `endpoint_id`.
    pub(crate) fn unregister_subscription_from(&self, subscription: &Subscription, endpoint_id: &str) {
        let key = subscription.key();
        let queue = {
            let mut state = self.state.lock();
            state.subscriptions.retain(|k| k != &key);
            state.queues.get(endpoint_id).cloned()
        };
        if let Some(queue) = queue {
            queue.remove_subscriber(&subscription.subscriber_id());
        }
    }

    // -- outbound queues ----------------------------------------------------

    /// The outbound queue for `endpoint_id`, created on first use.
    pub fn outbound_queue(&self, endpoint_id: &str) -> Arc<EndpointQueue> {
        let mut state = self.state.lock();
        Arc::clone(
            state
                .queues
                .entry(endpoint_id.to_string())
                .or_insert_with(|| Arc::new(EndpointQueue::new(self.id.clone(), endpoint_id))),
        )
    }

    pub(crate) fn register_throttle(
        &self,
        endpoint_id: &str,
        subscriber_id: &str,
        tuple: &str,
        settings: &ThrottleSettings,
        max_frequency: u32,
    ) -> bool {
        self.outbound_queue(endpoint_id)
            .register_subscriber(subscriber_id, tuple, settings, max_frequency)
    }

    pub(crate) fn unregister_throttle(&self, endpoint_id: &str, subscriber_id: &str, tuple: &str) {
        let queue = self.state.lock().queues.get(endpoint_id).cloned();
        if let Some(queue) = queue {
            queue.unregister_subscriber(subscriber_id, tuple);
        }
    }

    /// Enqueue `message` for delivery through `endpoint_id` on behalf of
    /// `subscriber_id`, which keys the queue's throttle.
    pub fn push(&self, endpoint_id: &str, subscriber_id: &str, message: Message) -> Result<Enqueued, BrokerError> {
        if !self.is_valid() {
            return Err(BrokerError::Invalidated("Client"));
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let outcome = self
            .outbound_queue(endpoint_id)
            .push(subscriber_id, message, now_ms);
        tracing::trace!(client_id = %self.id, endpoint = endpoint_id, ?outcome, "message pushed");
        Ok(outcome)
    }

    /// Take every message waiting on `endpoint_id`.
    pub fn poll(&self, endpoint_id: &str) -> Result<Vec<Message>, BrokerError> {
        if !self.is_valid() {
            return Err(BrokerError::Invalidated("Client"));
        }
        self.touch();
        let queue = self.outbound_queue(endpoint_id);
        Ok(queue.drain(chrono::Utc::now().timestamp_millis()))
    }

    /// Messages for `destination_id` only; anything else queued on the
    /// endpoint stays for the next poll.
    pub fn poll_destination(&self, endpoint_id: &str, destination_id: &str) -> Result<Vec<Message>, BrokerError> {
        if !self.is_valid() {
            return Err(BrokerError::Invalidated("Client"));
        }
        self.touch();
        let queue = self.outbound_queue(endpoint_id);
        Ok(queue.drain_where(chrono::Utc::now().timestamp_millis(), |m| {
            m.destination.as_deref() == Some(destination_id)
        }))
    }

    /// Long-poll: wait up to `wait` for messages on `endpoint_id`. Returns
    /// early, possibly empty, when the session or this client is invalidated.
    pub async fn poll_wait(
        &self,
        endpoint_id: &str,
        wait: Duration,
        session: Option<&Session>,
    ) -> Result<Vec<Message>, BrokerError> {
        let deadline = tokio::time::Instant::now() + wait;
        let queue = self.outbound_queue(endpoint_id);
        let session_closed = session.map(Session::closed).unwrap_or_default();

        loop {
            let messages = self.poll(endpoint_id)?;
            if !messages.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(messages);
            }
            let park = if queue.has_deferred() {
                deadline.min(tokio::time::Instant::now() + DEFERRED_RECHECK)
            } else {
                deadline
            };
            tokio::select! {
                _ = queue.ready() => {}
                _ = tokio::time::sleep_until(park) => {}
                _ = session_closed.cancelled() => return Ok(Vec::new()),
                _ = self.closed.cancelled() => return Err(BrokerError::Invalidated("Client")),
            }
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Destroy the identity. Owned subscriptions are invalidated unless they
    /// were registered independently, in which case only ownership is released.
    pub fn invalidate(&self) {
        let (timeout, session_ids, subscriptions, queues) = {
            let mut state = self.state.lock();
            if !state.valid || state.invalidating {
                return;
            }
            state.invalidating = true;
            (
                state.timeout.take(),
                std::mem::take(&mut state.session_ids),
                std::mem::take(&mut state.subscriptions),
                std::mem::take(&mut state.queues),
            )
        };
        let broker = self.broker.upgrade();

        if let Some(broker) = &broker {
            broker.clients().remove(&self.id);
            if let Some(handle) = timeout {
                broker.timeouts().cancel(handle);
            }
            for session_id in &session_ids {
                if let Some(session) = broker.sessions().get(session_id) {
                    session.unregister_client(&self.id);
                }
            }
            for key in &subscriptions {
                let Some(subscription) = broker.subscription(key) else {
                    continue;
                };
                if subscription.is_registered() {
                    subscription.release_client();
                } else {
                    subscription.invalidate(false);
                }
            }
        }

        for listener in self.destroyed_listeners.drain().iter() {
            listener.client_destroyed(self);
        }
        for queue in queues.values() {
            queue.close();
        }

        {
            let mut state = self.state.lock();
            state.valid = false;
            state.invalidating = false;
        }
        self.closed.cancel();
        tracing::info!(
            client_id = %self.id,
            sessions = session_ids.len(),
            subscriptions = subscriptions.len(),
            "client invalidated"
        );
    }
}

impl Expirable for ClientIdentity {
    fn timeout_period(&self) -> Duration {
        self.timeout_period
    }

    fn last_use(&self) -> Instant {
        self.state.lock().last_use
    }

    fn timeout(&self) {
        if self.state.lock().session_ids.is_empty() {
            tracing::debug!(client_id = %self.id, "orphaned client timed out");
            self.invalidate();
        }
    }

    fn set_timeout_handle(&self, handle: Option<TimeoutHandle>) {
        self.state.lock().timeout = handle;
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::provider::POLLING;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Destroyed(AtomicUsize);

    impl ClientListener for Destroyed {
        fn client_destroyed(&self, _client: &ClientIdentity) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn last_session_leaving_destroys_client_without_timeout() {
        let broker = MessageBroker::new();
        let s1 = broker.sessions().create_session(POLLING).unwrap();
        let s2 = broker.sessions().create_session(POLLING).unwrap();
        let client = broker.clients().get_or_create(None).unwrap();
        let destroyed = Arc::new(Destroyed::default());
        client.add_destroyed_listener(destroyed.clone()).unwrap();

        client.register_session(&s1).unwrap();
        client.register_session(&s2).unwrap();
        assert_eq!(s1.client_ids(), vec![client.id().to_string()]);

        s1.invalidate();
        assert!(client.is_valid());
        s2.invalidate();
        assert!(!client.is_valid());
        assert_eq!(destroyed.0.load(Ordering::SeqCst), 1);
        assert!(broker.clients().get(client.id()).is_none());
    }

    #[test]
    fn orphan_timeout_keeps_client_alive_for_reconnect() {
        let broker = MessageBroker::builder()
            .client_timeout(Duration::from_secs(60))
            .build();
        let s1 = broker.sessions().create_session(POLLING).unwrap();
        let client = broker.clients().get_or_create(Some("c-1")).unwrap();
        client.register_session(&s1).unwrap();

        s1.invalidate();
        assert!(client.is_valid());
        assert_eq!(broker.timeouts().pending(), 1);

        // Reconnecting cancels the orphan timeout.
        let s2 = broker.sessions().create_session(POLLING).unwrap();
        client.register_session(&s2).unwrap();
        assert_eq!(broker.timeouts().pending(), 0);

        s2.invalidate();
        broker
            .timeouts()
            .run_due(Instant::now() + Duration::from_secs(61));
        assert!(!client.is_valid());
    }

    #[test]
    fn push_and_poll_through_endpoint_queue() {
        let broker = MessageBroker::new();
        let client = broker.clients().get_or_create(None).unwrap();
        client
            .push("poll", "quotes", Message::data("quotes", json!(1)))
            .unwrap();
        client
            .push("stream", "quotes", Message::data("quotes", json!(2)))
            .unwrap();

        let polled = client.poll("poll").unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].body, json!(1));
        assert!(client.poll("poll").unwrap().is_empty());
    }

    #[test]
    fn invalid_client_rejects_push() {
        let broker = MessageBroker::new();
        let client = broker.clients().get_or_create(None).unwrap();
        client.invalidate();
        client.invalidate();
        let err = client
            .push("poll", "quotes", Message::data("quotes", json!(1)))
            .unwrap_err();
        assert_eq!(err.code(), crate::error::INVALIDATED);
        assert!(client.closed().is_cancelled());
    }

    #[tokio::test]
    async fn poll_wait_returns_when_message_arrives() {
        let broker = MessageBroker::new();
        let client = broker.clients().get_or_create(None).unwrap();
        let pusher = {
            let client = client.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                client
                    .push("poll", "quotes", Message::data("quotes", json!("late")))
                    .unwrap();
            })
        };
        let messages = client
            .poll_wait("poll", Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        pusher.await.unwrap();
    }

    #[tokio::test]
    async fn poll_wait_exits_when_session_invalidated() {
        let broker = MessageBroker::new();
        let session = broker.sessions().create_session(POLLING).unwrap();
        let client = broker.clients().get_or_create(None).unwrap();
        client.register_session(&session).unwrap();

        let waiter = {
            let client = client.clone();
            let session = session.clone();
            tokio::spawn(async move {
                client
                    .poll_wait("poll", Duration::from_secs(30), Some(&session))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.invalidate();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("long-poll did not wake")
            .unwrap();
        // The client went down with its only session, so either outcome is an exit.
        assert!(result.map(|m| m.is_empty()).unwrap_or(true));
    }
}
