//! A destination: a named address within a service, with its channel list,
//! security constraint, throttle and subscription set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::{json, Value};

use crate::error::BrokerError;
use crate::messaging::manager::SubscriptionManager;
use crate::messaging::throttle::ThrottleManager;
use crate::settings::DestinationSettings;

use super::MessageBroker;

pub struct Destination {
    id: String,
    service_id: String,
    channels: Vec<String>,
    security_constraint: Option<String>,
    reliable: bool,
    throttle: ThrottleManager,
    subscriptions: Arc<SubscriptionManager>,
    started: AtomicBool,
}

impl Destination {
    pub fn new(
        settings: &DestinationSettings,
        service_id: &str,
        broker: Weak<MessageBroker>,
    ) -> Result<Self, BrokerError> {
        if settings.id.trim().is_empty() {
            return Err(BrokerError::configuration("destination id must not be empty"));
        }
        settings.throttle.validate(&settings.id)?;
        Ok(Self {
            id: settings.id.clone(),
            service_id: service_id.to_string(),
            channels: settings.channels.clone(),
            security_constraint: settings.security_constraint.clone(),
            reliable: settings.reliable,
            throttle: ThrottleManager::new(&settings.id, settings.throttle.clone()),
            subscriptions: Arc::new(SubscriptionManager::new(settings, service_id, broker)),
            started: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Configured channel ids. Empty means the broker's default channels apply.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn security_constraint(&self) -> Option<&str> {
        self.security_constraint.as_deref()
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn throttle(&self) -> &ThrottleManager {
        &self.throttle
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!(destination = %self.id, service = %self.service_id, "destination started");
        }
    }

    /// Stop accepting messages and invalidate every subscription.
    pub fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            self.subscriptions.stop();
            tracing::debug!(destination = %self.id, "destination stopped");
        }
    }

    pub fn describe(&self) -> Value {
        json!({
            "id": self.id,
            "channels": self.channels,
            "reliable": self.reliable,
        })
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("id", &self.id)
            .field("service_id", &self.service_id)
            .field("started", &self.is_started())
            .finish()
    }
}
