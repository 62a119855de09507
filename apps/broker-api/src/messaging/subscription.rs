//! Subscriptions: one consumer's interest in a destination, aggregating any
//! number of `{selector, subtopic}` tuples under a single identity.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::broker::context::RequestContext;
use crate::broker::MessageBroker;
use crate::error::BrokerError;
use crate::listeners::ListenerList;
use crate::message::{headers, CommandOperation, Message};
use crate::session::Session;
use crate::timeout::{Expirable, TimeoutHandle};

use super::manager::SubscriptionManager;
use super::selector::Selector;
use super::subtopic::Subtopic;
use super::throttle::{ThrottlePolicy, ThrottleSettings};

/// Identity of a subscription: the consumer's client id within a destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub destination_id: String,
    pub client_id: String,
}

impl SubscriptionKey {
    pub fn new(destination_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            destination_id: destination_id.into(),
            client_id: client_id.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.destination_id, self.client_id)
    }
}

/// One `{selector, subtopic}` tuple with its compiled forms. Equality
/// ignores `max_frequency`.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    selector: Option<String>,
    subtopic: Option<String>,
    max_frequency: u32,
    compiled_selector: Option<Selector>,
    parsed_subtopic: Option<Subtopic>,
}

impl SubscriptionInfo {
    pub fn new(
        selector: Option<&str>,
        subtopic: Option<&str>,
        max_frequency: u32,
        separator: &str,
    ) -> Result<Self, BrokerError> {
        let selector = selector.filter(|s| !s.trim().is_empty());
        let subtopic = subtopic.filter(|s| !s.is_empty());
        Ok(Self {
            selector: selector.map(str::to_string),
            subtopic: subtopic.map(str::to_string),
            max_frequency,
            compiled_selector: selector.map(Selector::compile).transpose()?,
            parsed_subtopic: subtopic.map(|s| Subtopic::parse(s, separator)).transpose()?,
        })
    }

    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    pub fn subtopic(&self) -> Option<&str> {
        self.subtopic.as_deref()
    }

    pub fn max_frequency(&self) -> u32 {
        self.max_frequency
    }

    /// Key naming this tuple in the owner's outbound throttle.
    fn throttle_key(&self) -> String {
        criteria_key(self.selector(), self.subtopic())
    }

    fn same_criteria(&self, selector: Option<&str>, subtopic: Option<&str>) -> bool {
        self.selector.as_deref() == selector && self.subtopic.as_deref() == subtopic
    }

    /// Subtopic first, then selector. If either side defines a subtopic,
    /// both must. A selector that fails to evaluate does not match.
    pub fn matches(&self, message: &Message, message_subtopic: Option<&Subtopic>, evaluate_selector: bool) -> bool {
        match (&self.parsed_subtopic, message_subtopic) {
            (None, None) => {}
            (Some(ours), Some(theirs)) => {
                if !ours.matches(theirs) {
                    return false;
                }
            }
            _ => return false,
        }

        let Some(selector) = self.compiled_selector.as_ref().filter(|_| evaluate_selector) else {
            return true;
        };
        match selector.matches(message) {
            Ok(matched) => matched,
            Err(err) => {
                tracing::warn!(
                    selector = selector.source(),
                    message_id = ?message.message_id,
                    error = %err,
                    "error processing message selector"
                );
                false
            }
        }
    }
}

impl PartialEq for SubscriptionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.same_criteria(other.selector(), other.subtopic())
    }
}

impl Eq for SubscriptionInfo {}

fn criteria_key(selector: Option<&str>, subtopic: Option<&str>) -> String {
    format!("{}\u{1f}{}", subtopic.unwrap_or_default(), selector.unwrap_or_default())
}

pub trait SubscriptionListener: Send + Sync {
    fn subscription_created(&self, _subscription: &Arc<Subscription>) {}
    fn subscription_destroyed(&self, _subscription: &Subscription) {}
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

struct SubscriptionState {
    valid: bool,
    invalidating: bool,
    endpoint_id: Option<String>,
    session_id: Option<String>,
    owner_id: Option<String>,
    infos: Vec<SubscriptionInfo>,
    last_use: Instant,
    timeout: Option<TimeoutHandle>,
}

pub struct Subscription {
    key: SubscriptionKey,
    service_id: String,
    separator: String,
    timeout_period: Duration,
    throttle: ThrottleSettings,
    broker: Weak<MessageBroker>,
    state: Mutex<SubscriptionState>,
    /// Held by code outside the subscribe path; keeps the subscription alive
    /// with no tuples and survives owner destruction.
    registered: AtomicBool,
    attempting_notification: AtomicBool,
    destroyed_listeners: ListenerList<dyn SubscriptionListener>,
}

impl Subscription {
    pub(crate) fn new(
        manager: &SubscriptionManager,
        client_id: &str,
        endpoint_id: Option<&str>,
        ctx: &RequestContext,
        broker: Weak<MessageBroker>,
    ) -> Self {
        Self {
            key: SubscriptionKey::new(manager.destination_id(), client_id),
            service_id: manager.service_id().to_string(),
            separator: manager.separator().to_string(),
            timeout_period: manager.timeout(),
            throttle: manager.throttle_settings().clone(),
            broker,
            state: Mutex::new(SubscriptionState {
                valid: true,
                invalidating: false,
                endpoint_id: endpoint_id.map(str::to_string),
                session_id: ctx.session.as_ref().map(|s| s.id().to_string()),
                owner_id: ctx.client.as_ref().map(|c| c.id().to_string()),
                infos: Vec::new(),
                last_use: Instant::now(),
                timeout: None,
            }),
            registered: AtomicBool::new(false),
            attempting_notification: AtomicBool::new(false),
            destroyed_listeners: ListenerList::new(),
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        self.key.clone()
    }

    pub fn client_id(&self) -> &str {
        &self.key.client_id
    }

    pub fn destination_id(&self) -> &str {
        &self.key.destination_id
    }

    /// Queue-level identity used by the owner's outbound throttle.
    pub fn subscriber_id(&self) -> String {
        self.key.to_string()
    }

    pub fn endpoint_id(&self) -> Option<String> {
        self.state.lock().endpoint_id.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    /// Id of the owning client identity, if any.
    pub fn owner_id(&self) -> Option<String> {
        self.state.lock().owner_id.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub(crate) fn set_registered(&self, registered: bool) -> bool {
        self.registered.swap(registered, Ordering::SeqCst)
    }

    /// Whether the current invalidation tried to tell the client.
    pub fn is_attempting_notification(&self) -> bool {
        self.attempting_notification.load(Ordering::SeqCst)
    }

    /// Number of active tuples; the subscription's reference count.
    pub fn subscription_count(&self) -> usize {
        self.state.lock().infos.len()
    }

    /// Snapshot of `(selector, subtopic)` pairs.
    pub fn criteria(&self) -> Vec<(Option<String>, Option<String>)> {
        self.state
            .lock()
            .infos
            .iter()
            .map(|i| (i.selector.clone(), i.subtopic.clone()))
            .collect()
    }

    pub fn touch(&self) {
        self.state.lock().last_use = Instant::now();
    }

    pub(crate) fn has_timeout(&self) -> bool {
        self.state.lock().timeout.is_some()
    }

    /// Detach from an owner identity that is going away while something else
    /// still holds this subscription.
    pub(crate) fn release_client(&self) {
        let owner = self.state.lock().owner_id.take();
        if let Some(owner) = owner {
            tracing::debug!(subscription = %self.key, client_id = %owner, "subscription released by client");
        }
    }

    pub fn add_destroyed_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        self.destroyed_listeners.add(listener);
    }

    pub fn remove_destroyed_listener(&self, listener: &Arc<dyn SubscriptionListener>) {
        self.destroyed_listeners.remove(listener);
    }

    fn owner(&self) -> Option<Arc<crate::client::ClientIdentity>> {
        let owner_id = self.owner_id()?;
        self.broker.upgrade()?.clients().get(&owner_id)
    }

    // -- tuples -------------------------------------------------------------

    /// Add a tuple. Returns `false` when the same criteria are already present.
    pub fn add_subscription(
        &self,
        selector: Option<&str>,
        subtopic: Option<&str>,
        max_frequency: u32,
    ) -> Result<bool, BrokerError> {
        let info = SubscriptionInfo::new(selector, subtopic, max_frequency, &self.separator)?;
        let tuple = info.throttle_key();
        let endpoint_id = {
            let mut state = self.state.lock();
            if !state.valid || state.invalidating {
                return Err(BrokerError::Invalidated("Subscription"));
            }
            if state.infos.contains(&info) {
                tracing::warn!(
                    subscription = %self.key,
                    selector = ?info.selector,
                    subtopic = ?info.subtopic,
                    "client already subscribed with these criteria"
                );
                return Ok(false);
            }
            state.infos.push(info);
            state.last_use = Instant::now();
            state.endpoint_id.clone()
        };
        self.register_throttle(endpoint_id.as_deref(), &tuple, max_frequency);
        Ok(true)
    }

    fn register_throttle(&self, endpoint_id: Option<&str>, tuple: &str, max_frequency: u32) {
        let ts = &self.throttle;
        if ts.outbound_policy != ThrottlePolicy::None
            && (ts.is_outbound_client_throttle_enabled() || max_frequency > 0)
        {
            if let (Some(owner), Some(endpoint_id)) = (self.owner(), endpoint_id) {
                owner.register_throttle(endpoint_id, &self.subscriber_id(), tuple, ts, max_frequency);
            }
        } else if max_frequency > 0 {
            tracing::warn!(
                subscription = %self.key,
                max_frequency,
                "maxFrequency requested but the destination defines no throttling policy; ignoring it"
            );
        }
    }

    /// Remove a tuple. Returns `true` when no tuples remain.
    pub fn remove_subscription(&self, selector: Option<&str>, subtopic: Option<&str>) -> bool {
        let selector = selector.filter(|s| !s.trim().is_empty());
        let subtopic = subtopic.filter(|s| !s.is_empty());
        let (removed, now_empty, endpoint_id) = {
            let mut state = self.state.lock();
            let pos = state
                .infos
                .iter()
                .position(|i| i.same_criteria(selector, subtopic));
            if let Some(pos) = pos {
                state.infos.remove(pos);
            }
            (pos.is_some(), state.infos.is_empty(), state.endpoint_id.clone())
        };

        if !removed {
            tracing::error!(
                subscription = %self.key,
                ?selector,
                ?subtopic,
                "unable to find subscription to remove"
            );
            return now_empty;
        }

        if let (Some(owner), Some(endpoint_id)) = (self.owner(), endpoint_id.as_deref()) {
            let tuple = criteria_key(selector, subtopic);
            owner.unregister_throttle(endpoint_id, &self.subscriber_id(), &tuple);
        }
        if now_empty {
            self.cancel_timeout();
            if let Some(destination) = self
                .broker
                .upgrade()
                .and_then(|b| b.destination(&self.key.destination_id))
            {
                destination.throttle().remove_client(&self.key.client_id);
            }
        }
        now_empty
    }

    /// Whether any tuple matches `message`.
    pub fn test_message(&self, message: &Message) -> bool {
        self.matches(message, true)
    }

    pub(crate) fn matches(&self, message: &Message, evaluate_selector: bool) -> bool {
        let message_subtopic = match message.subtopic() {
            Some(s) if !s.is_empty() => match Subtopic::parse(s, &self.separator) {
                Ok(parsed) => Some(parsed),
                Err(_) => return false,
            },
            _ => None,
        };
        self.state
            .lock()
            .infos
            .iter()
            .any(|info| info.matches(message, message_subtopic.as_ref(), evaluate_selector))
    }

    // -- re-parenting -------------------------------------------------------

    /// Move the subscription to a new endpoint and session after a resubscribe.
    /// Nothing happens when either side is unknown or neither changed.
    pub fn reset_endpoint(&self, new_endpoint_id: &str, new_session: Option<&Arc<Session>>) {
        let Some(new_session) = new_session else {
            return;
        };
        let (old_endpoint, old_session) = {
            let mut state = self.state.lock();
            let (Some(endpoint_id), Some(session_id)) = (&state.endpoint_id, &state.session_id) else {
                return;
            };
            if endpoint_id == new_endpoint_id && session_id == new_session.id() {
                return;
            }
            let old_endpoint = state.endpoint_id.replace(new_endpoint_id.to_string());
            let old_session = state.session_id.replace(new_session.id().to_string());
            (old_endpoint, old_session)
        };

        let broker = self.broker.upgrade();
        let owner = self.owner();
        if let (Some(owner), Some(old_endpoint)) = (&owner, &old_endpoint) {
            owner.unregister_subscription_from(self, old_endpoint);
        }
        if let Some(old) = old_session
            .as_deref()
            .and_then(|id| broker.as_ref()?.sessions().get(id))
        {
            old.unregister_subscription(&self.key);
        }
        if let Err(err) = new_session.register_subscription(&self.key) {
            tracing::debug!(subscription = %self.key, error = %err, "new session rejected subscription");
        }
        if let Some(owner) = &owner {
            if owner.register_subscription(self).is_ok() {
                let tuples: Vec<(String, u32)> = self
                    .state
                    .lock()
                    .infos
                    .iter()
                    .map(|i| (i.throttle_key(), i.max_frequency))
                    .collect();
                for (tuple, max_frequency) in tuples {
                    self.register_throttle(Some(new_endpoint_id), &tuple, max_frequency);
                }
            }
        }

        tracing::debug!(
            subscription = %self.key,
            old_endpoint = ?old_endpoint,
            new_endpoint = new_endpoint_id,
            old_session = ?old_session,
            new_session = %new_session.id(),
            "subscription reset after resubscribe"
        );
    }

    // -- lifecycle ----------------------------------------------------------

    fn cancel_timeout(&self) {
        let handle = self.state.lock().timeout.take();
        if let (Some(handle), Some(broker)) = (handle, self.broker.upgrade()) {
            broker.timeouts().cancel(handle);
        }
    }

    /// Invalidate the subscription, optionally telling the client first.
    /// Idempotent; concurrent callers return immediately.
    pub fn invalidate(&self, notify_client: bool) {
        {
            let mut state = self.state.lock();
            if !state.valid || state.invalidating {
                return;
            }
            state.invalidating = true;
        }
        self.cancel_timeout();
        self.attempting_notification
            .store(notify_client, Ordering::SeqCst);
        let broker = self.broker.upgrade();

        if notify_client {
            if let (Some(broker), Some(owner)) = (&broker, self.owner()) {
                if owner.is_valid() {
                    let notice = Message::command(CommandOperation::SubscriptionInvalidate)
                        .with_destination(self.key.destination_id.clone())
                        .with_client_id(self.key.client_id.clone());
                    if let Err(err) = broker.route_message_to_message_client(notice, self) {
                        tracing::debug!(subscription = %self.key, error = %err, "invalidation notice not delivered");
                    }
                }
            }
        }

        for listener in self.destroyed_listeners.drain().iter() {
            listener.subscription_destroyed(self);
        }

        let (session_id, owner) = (self.session_id(), self.owner());
        if let Some(session) = session_id.and_then(|id| broker.as_ref()?.sessions().get(&id)) {
            session.unregister_subscription(&self.key);
        }
        if let Some(owner) = &owner {
            owner.unregister_subscription(self);
        }

        // Routed outside the lock so services can call back in.
        let unsubscribes: Vec<Message> = self
            .state
            .lock()
            .infos
            .iter()
            .map(|info| {
                let mut msg = Message::command(CommandOperation::Unsubscribe)
                    .with_destination(self.key.destination_id.clone())
                    .with_client_id(self.key.client_id.clone())
                    .with_header(headers::SUBSCRIPTION_INVALIDATED, true);
                if let Some(selector) = &info.selector {
                    msg.set_header(headers::SELECTOR, selector.clone());
                }
                if let Some(subtopic) = &info.subtopic {
                    msg.set_header(headers::SUBTOPIC, subtopic.clone());
                }
                msg
            })
            .collect();
        if let Some(broker) = &broker {
            let service = broker.service(&self.service_id);
            for unsubscribe in &unsubscribes {
                let Some(service) = &service else { break };
                let mut ctx = RequestContext::default();
                if let Err(err) = service.service_command(broker, &mut ctx, unsubscribe) {
                    tracing::debug!(
                        subscription = %self.key,
                        error = %err,
                        "unsubscribe issued during invalidation was not processed; continuing"
                    );
                }
            }
        }

        let remaining = self.subscription_count();
        if remaining > 0 {
            tracing::error!(subscription = %self.key, remaining, "failed to remove subscriptions during invalidation");
        }

        if let Some(manager) = broker
            .as_ref()
            .and_then(|b| b.destination(&self.key.destination_id))
            .map(|d| Arc::clone(d.subscriptions()))
        {
            if self.is_registered() {
                manager.release_subscription(self);
            }
            manager.remove_entry(self);
        }

        {
            let mut state = self.state.lock();
            state.valid = false;
            state.invalidating = false;
        }
        tracing::debug!(subscription = %self.key, notify_client, "subscription invalidated");
    }

    /// Idle timeout expired; tell the client.
    pub fn timeout(&self) {
        self.invalidate(true);
    }
}

impl Expirable for Subscription {
    fn timeout_period(&self) -> Duration {
        self.timeout_period
    }

    fn last_use(&self) -> Instant {
        self.state.lock().last_use
    }

    fn timeout(&self) {
        Subscription::timeout(self);
    }

    fn set_timeout_handle(&self, handle: Option<TimeoutHandle>) {
        self.state.lock().timeout = handle;
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("count", &self.subscription_count())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::subtopic::DEFAULT_SEPARATOR;
    use serde_json::json;

    fn info(selector: Option<&str>, subtopic: Option<&str>) -> SubscriptionInfo {
        SubscriptionInfo::new(selector, subtopic, 0, DEFAULT_SEPARATOR).unwrap()
    }

    fn quote(subtopic: Option<&str>, price: i64) -> (Message, Option<Subtopic>) {
        let mut msg = Message::data("quotes", json!({ "price": price }));
        if let Some(s) = subtopic {
            msg.set_header(headers::SUBTOPIC, s);
        }
        let parsed = subtopic.map(|s| Subtopic::parse(s, DEFAULT_SEPARATOR).unwrap());
        (msg, parsed)
    }

    #[test]
    fn info_equality_ignores_max_frequency() {
        let a = SubscriptionInfo::new(Some("x = 1"), Some("a"), 0, ".").unwrap();
        let b = SubscriptionInfo::new(Some("x = 1"), Some("a"), 5, ".").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, info(None, Some("a")));
    }

    #[test]
    fn subtopic_must_be_present_on_both_sides() {
        let (plain, none) = quote(None, 1);
        let (tagged, some) = quote(Some("sports"), 1);
        assert!(info(None, None).matches(&plain, none.as_ref(), true));
        assert!(!info(None, None).matches(&tagged, some.as_ref(), true));
        assert!(!info(None, Some("sports")).matches(&plain, none.as_ref(), true));
    }

    #[test]
    fn wildcard_subtopic_and_selector() {
        let sports = info(None, Some("sports.*"));
        let (football, f) = quote(Some("sports.football"), 50);
        let (stocks, s) = quote(Some("finance.stocks"), 500);
        assert!(sports.matches(&football, f.as_ref(), true));
        assert!(!sports.matches(&stocks, s.as_ref(), true));

        let pricey = info(Some("price > 100"), Some("sports.*"));
        assert!(!pricey.matches(&football, f.as_ref(), true));
        let (dear, d) = quote(Some("sports.tennis"), 150);
        assert!(pricey.matches(&dear, d.as_ref(), true));
        // Selector skipped when not evaluated.
        assert!(pricey.matches(&football, f.as_ref(), false));
    }

    #[test]
    fn bad_selector_is_rejected_up_front() {
        assert!(SubscriptionInfo::new(Some("price >"), None, 0, ".").is_err());
        assert!(SubscriptionInfo::new(None, Some("spo*rts"), 0, ".").is_err());
    }
}
