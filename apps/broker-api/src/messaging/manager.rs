//! Per-destination table of subscriptions, keyed by consumer client id.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::broker::context::RequestContext;
use crate::broker::MessageBroker;
use crate::error::BrokerError;
use crate::listeners::ListenerList;
use crate::message::Message;
use crate::settings::DestinationSettings;
use crate::timeout::Expirable;

use super::subscription::{Subscription, SubscriptionInfo, SubscriptionListener};
use super::subtopic::Subtopic;
use super::throttle::ThrottleSettings;

pub struct SubscriptionManager {
    destination_id: String,
    service_id: String,
    separator: String,
    allow_subtopics: bool,
    disallow_wildcard_subtopics: bool,
    timeout: Duration,
    throttle: ThrottleSettings,
    broker: Weak<MessageBroker>,
    subscriptions: DashMap<String, Arc<Subscription>>,
    created_listeners: ListenerList<dyn SubscriptionListener>,
    /// Serializes get-or-create against removal.
    structure: Mutex<()>,
}

impl SubscriptionManager {
    pub fn new(settings: &DestinationSettings, service_id: &str, broker: Weak<MessageBroker>) -> Self {
        Self {
            destination_id: settings.id.clone(),
            service_id: service_id.to_string(),
            separator: settings.subtopic_separator.clone(),
            allow_subtopics: settings.allow_subtopics,
            disallow_wildcard_subtopics: settings.disallow_wildcard_subtopics,
            timeout: Duration::from_secs(settings.subscription_timeout_minutes * 60),
            throttle: settings.throttle.clone(),
            broker,
            subscriptions: DashMap::new(),
            created_listeners: ListenerList::new(),
            structure: Mutex::new(()),
        }
    }

    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Idle period after which subscriptions time out. Zero disables.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn throttle_settings(&self) -> &ThrottleSettings {
        &self.throttle
    }

    pub fn add_created_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        self.created_listeners.add(listener);
    }

    pub fn remove_created_listener(&self, listener: &Arc<dyn SubscriptionListener>) {
        self.created_listeners.remove(listener);
    }

    fn check_subtopic(&self, subtopic: Option<&str>) -> Result<(), BrokerError> {
        let Some(value) = subtopic.filter(|s| !s.is_empty()) else {
            return Ok(());
        };
        if !self.allow_subtopics {
            return Err(BrokerError::routing(format!(
                "destination '{}' does not allow subtopics; cannot subscribe to '{value}'",
                self.destination_id
            )));
        }
        let parsed = Subtopic::parse(value, &self.separator)?;
        if parsed.contains_wildcard() && self.disallow_wildcard_subtopics {
            return Err(BrokerError::routing(format!(
                "destination '{}' does not allow wildcard subtopics; cannot subscribe to '{value}'",
                self.destination_id
            )));
        }
        Ok(())
    }

    /// Get or create the subscription for `client_id`, associating a new one
    /// with the requesting session and client identity.
    fn obtain(
        &self,
        ctx: &RequestContext,
        client_id: &str,
        endpoint_id: Option<&str>,
    ) -> Result<(Arc<Subscription>, bool), BrokerError> {
        let (subscription, created) = {
            let _guard = self.structure.lock();
            match self.subscriptions.get(client_id).map(|s| Arc::clone(s.value())) {
                Some(existing) if existing.is_valid() => {
                    if let (Some(client), Some(owner)) = (&ctx.client, existing.owner_id()) {
                        if client.id() != owner {
                            return Err(BrokerError::routing(format!(
                                "subscription '{client_id}' on destination '{}' belongs to another client",
                                self.destination_id
                            )));
                        }
                    }
                    (existing, false)
                }
                _ => {
                    let subscription = Arc::new(Subscription::new(
                        self,
                        client_id,
                        endpoint_id,
                        ctx,
                        self.broker.clone(),
                    ));
                    self.subscriptions
                        .insert(client_id.to_string(), Arc::clone(&subscription));
                    (subscription, true)
                }
            }
        };

        if created {
            let key = subscription.key();
            let registered = ctx
                .session
                .as_ref()
                .map_or(Ok(()), |s| s.register_subscription(&key))
                .and_then(|_| {
                    ctx.client
                        .as_ref()
                        .map_or(Ok(()), |c| c.register_subscription(&subscription))
                });
            if let Err(err) = registered {
                self.remove_entry(&subscription);
                if let Some(session) = &ctx.session {
                    session.unregister_subscription(&key);
                }
                return Err(err);
            }
        } else if let Some(endpoint_id) = endpoint_id {
            // A resubscribe may arrive over a new endpoint or session.
            subscription.reset_endpoint(endpoint_id, ctx.session.as_ref());
        }
        Ok((subscription, created))
    }

    /// Subscribe `client_id` with the given criteria.
    pub fn add_subscriber(
        &self,
        ctx: &RequestContext,
        client_id: &str,
        selector: Option<&str>,
        subtopic: Option<&str>,
        endpoint_id: Option<&str>,
        max_frequency: u32,
    ) -> Result<Arc<Subscription>, BrokerError> {
        self.check_subtopic(subtopic)?;
        SubscriptionInfo::new(selector, subtopic, max_frequency, &self.separator)?;

        let (subscription, created) = self.obtain(ctx, client_id, endpoint_id)?;
        subscription.touch();
        let added = match subscription.add_subscription(selector, subtopic, max_frequency) {
            Ok(added) => added,
            Err(err) => {
                if created {
                    subscription.invalidate(false);
                }
                return Err(err);
            }
        };

        if added {
            self.monitor_timeout(&subscription);
            if created {
                for listener in self.created_listeners.snapshot().iter() {
                    listener.subscription_created(&subscription);
                }
            }
            tracing::debug!(
                destination = %self.destination_id,
                client_id,
                ?selector,
                ?subtopic,
                count = subscription.subscription_count(),
                "subscriber added"
            );
        }
        Ok(subscription)
    }

    /// Remove one tuple. When it was the last one, and nothing else holds
    /// the subscription, it is invalidated. Returns whether it was the last.
    pub fn remove_subscriber(&self, client_id: &str, selector: Option<&str>, subtopic: Option<&str>) -> bool {
        let Some(subscription) = self.subscription(client_id) else {
            return false;
        };
        let last = subscription.remove_subscription(selector, subtopic);
        if last && !subscription.is_registered() {
            self.remove_entry(&subscription);
            subscription.invalidate(false);
        }
        tracing::debug!(destination = %self.destination_id, client_id, last, "subscriber removed");
        last
    }

    /// Hold a subscription for code that tracks consumers itself. A
    /// registered subscription stays alive with no tuples until released.
    pub fn register_subscription(
        &self,
        ctx: &RequestContext,
        client_id: &str,
        endpoint_id: Option<&str>,
    ) -> Result<Arc<Subscription>, BrokerError> {
        let (subscription, _) = self.obtain(ctx, client_id, endpoint_id)?;
        subscription.set_registered(true);
        self.monitor_timeout(&subscription);
        Ok(subscription)
    }

    /// Drop the registration hold; a subscription left with no tuples goes away.
    pub fn release_subscription(&self, subscription: &Subscription) {
        subscription.set_registered(false);
        if subscription.subscription_count() == 0 {
            self.remove_entry(subscription);
            subscription.invalidate(false);
        }
    }

    pub(crate) fn remove_entry(&self, subscription: &Subscription) {
        let _guard = self.structure.lock();
        self.subscriptions.remove_if(subscription.client_id(), |_, held| {
            std::ptr::eq(Arc::as_ptr(held), subscription)
        });
    }

    fn monitor_timeout(&self, subscription: &Arc<Subscription>) {
        if self.timeout.is_zero() || subscription.has_timeout() {
            return;
        }
        if let Some(broker) = self.broker.upgrade() {
            let target: Arc<dyn Expirable> = subscription.clone();
            broker.timeouts().watch(Arc::downgrade(&target));
        }
    }

    pub fn subscription(&self, client_id: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.get(client_id).map(|s| Arc::clone(s.value()))
    }

    pub fn subscriber_ids(&self) -> Vec<String> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Every subscription with a tuple matching `message`.
    pub fn matching_subscriptions(&self, message: &Message, evaluate_selector: bool) -> Vec<Arc<Subscription>> {
        let candidates: Vec<Arc<Subscription>> =
            self.subscriptions.iter().map(|e| Arc::clone(e.value())).collect();
        candidates
            .into_iter()
            .filter(|s| s.is_valid() && s.matches(message, evaluate_selector))
            .collect()
    }

    /// Client ids of the subscriptions matching `message`.
    pub fn subscriber_ids_for(&self, message: &Message, evaluate_selector: bool) -> Vec<String> {
        self.matching_subscriptions(message, evaluate_selector)
            .iter()
            .map(|s| s.client_id().to_string())
            .collect()
    }

    /// Time out subscriptions idle for longer than the destination timeout.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        if self.timeout.is_zero() {
            return 0;
        }
        let expired: Vec<Arc<Subscription>> = self
            .subscriptions
            .iter()
            .filter(|e| now.saturating_duration_since(Expirable::last_use(e.value().as_ref())) >= self.timeout)
            .map(|e| Arc::clone(e.value()))
            .collect();
        for subscription in &expired {
            subscription.timeout();
        }
        expired.len()
    }

    /// Invalidate every subscription without notifying clients.
    pub fn stop(&self) {
        let all: Vec<Arc<Subscription>> = self.subscriptions.iter().map(|e| Arc::clone(e.value())).collect();
        for subscription in all {
            subscription.invalidate(false);
            if subscription.is_valid() {
                tracing::error!(subscription = %subscription.key(), "failed to remove subscriber");
            }
        }
    }
}
