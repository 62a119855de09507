//! Registry of live sessions and the providers that create them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use broker_common::id::{prefix, prefixed_ulid};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::broker::MessageBroker;
use crate::error::BrokerError;
use crate::listeners::ListenerList;
use crate::timeout::Expirable;

use super::provider::SessionProvider;
use super::{Session, SessionListener};

const HOUR: Duration = Duration::from_secs(60 * 60);

/// Sessions disconnected longer than this are reclaimed by the sweeper.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(5 * 60);

struct HourlyPeak {
    hour_start: Instant,
    max: usize,
}

/// Shared registry of all sessions, keyed by id.
///
/// Sessions remove themselves on invalidation, so an entry here is always a
/// live session.
pub struct SessionRegistry {
    broker: Weak<MessageBroker>,
    sessions: DashMap<String, Arc<Session>>,
    providers: DashMap<&'static str, Arc<dyn SessionProvider>>,
    created_listeners: ListenerList<dyn SessionListener>,
    peak: Mutex<HourlyPeak>,
    started: AtomicBool,
}

impl SessionRegistry {
    pub(crate) fn new(broker: Weak<MessageBroker>) -> Self {
        Self {
            broker,
            sessions: DashMap::new(),
            providers: DashMap::new(),
            created_listeners: ListenerList::new(),
            peak: Mutex::new(HourlyPeak {
                hour_start: Instant::now(),
                max: 0,
            }),
            started: AtomicBool::new(false),
        }
    }

    /// Register a provider, replacing (and stopping) any previous one of the same kind.
    pub fn register_provider(&self, provider: Arc<dyn SessionProvider>) {
        let kind = provider.kind();
        if self.started.load(Ordering::SeqCst) {
            provider.start();
        }
        if let Some(previous) = self.providers.insert(kind, provider) {
            previous.stop();
        }
        tracing::debug!(provider = kind, "session provider registered");
    }

    pub fn provider(&self, kind: &str) -> Option<Arc<dyn SessionProvider>> {
        self.providers.get(kind).map(|p| Arc::clone(p.value()))
    }

    /// Create and register a session through the provider of `kind`.
    pub fn create_session(&self, kind: &str) -> Result<Arc<Session>, BrokerError> {
        let provider = self.provider(kind).ok_or_else(|| {
            BrokerError::configuration(format!("no session provider registered for '{kind}'"))
        })?;
        let session = Arc::new(Session::new(
            prefixed_ulid(prefix::SESSION),
            provider,
            self.broker.clone(),
        ));
        self.sessions
            .insert(session.id().to_string(), Arc::clone(&session));
        self.record_peak();

        if let Some(broker) = self.broker.upgrade() {
            let target: Arc<dyn Expirable> = session.clone();
            broker.timeouts().watch(Arc::downgrade(&target));
        }

        tracing::info!(session_id = %session.id(), provider = kind, "session created");
        session.notify_created();
        Ok(session)
    }

    fn record_peak(&self) {
        let count = self.sessions.len();
        let mut peak = self.peak.lock();
        if peak.hour_start.elapsed() >= HOUR {
            peak.hour_start = Instant::now();
            peak.max = count;
        }
        peak.max = peak.max.max(count);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub(crate) fn unregister(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Highest concurrent session count seen since the top of the current hour.
    pub fn max_sessions_in_current_hour(&self) -> usize {
        let mut peak = self.peak.lock();
        if peak.hour_start.elapsed() >= HOUR {
            peak.hour_start = Instant::now();
            peak.max = self.sessions.len();
        }
        peak.max
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    // -- created listeners --------------------------------------------------

    pub fn add_created_listener(&self, listener: Arc<dyn SessionListener>) {
        self.created_listeners.add(listener);
    }

    pub fn remove_created_listener(&self, listener: &Arc<dyn SessionListener>) {
        self.created_listeners.remove(listener);
    }

    pub(crate) fn notify_created(&self, session: &Arc<Session>) {
        for listener in self.created_listeners.snapshot().iter() {
            listener.session_created(session);
        }
    }

    // -- maintenance --------------------------------------------------------

    /// Invalidate sessions that have been disconnected for longer than `grace`.
    /// Returns the number of sessions invalidated.
    pub fn sweep_disconnected(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|e| e.value().disconnected_for(now).is_some_and(|d| d >= grace))
            .map(|e| Arc::clone(e.value()))
            .collect();
        for session in &expired {
            session.invalidate();
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "swept disconnected sessions");
        }
        expired.len()
    }

    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for provider in self.providers.iter() {
            provider.value().start();
        }
    }

    /// Stop providers and invalidate every live session.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        for session in sessions {
            session.invalidate();
        }
        for provider in self.providers.iter() {
            provider.value().stop();
        }
    }
}
