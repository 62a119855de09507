//! Sessions: one logical connection context with attributes, a principal,
//! connectivity state and the client identities and subscriptions created
//! over it.
//!
//! A session does not hold references to its clients or subscriptions. It
//! records their ids and reaches them through the owning broker when it is
//! invalidated, so the ownership graph stays acyclic.

pub mod provider;
pub mod registry;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::broker::MessageBroker;
use crate::error::BrokerError;
use crate::listeners::ListenerList;
use crate::messaging::subscription::SubscriptionKey;
use crate::security::Principal;
use crate::timeout::{Expirable, TimeoutHandle};

use provider::SessionProvider;

// ---------------------------------------------------------------------------
// Listener contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeEventKind {
    Bound,
    Unbound,
    Added,
    Removed,
    Replaced,
}

/// An attribute change. For `Replaced`, `value` is the old value.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeEvent {
    pub kind: AttributeEventKind,
    pub name: String,
    pub value: Value,
}

pub trait SessionAttributeListener: Send + Sync {
    fn attribute_changed(&self, session: &Session, event: &AttributeEvent);
}

pub trait SessionListener: Send + Sync {
    fn session_created(&self, _session: &Arc<Session>) {}
    fn session_destroyed(&self, _session: &Session) {}
}

pub trait ConnectivityListener: Send + Sync {
    fn session_connected(&self, session: &Session);
    fn session_disconnected(&self, session: &Session);
}

/// Credentials a client supplied for a backend destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCredentials {
    pub username: String,
    pub password: String,
    pub charset: Option<String>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionState {
    valid: bool,
    invalidating: bool,
    creation_notified: bool,
    attributes: HashMap<String, Value>,
    principal: Option<Principal>,
    connected: bool,
    disconnected_at: Option<Instant>,
    client_ids: Vec<String>,
    subscriptions: Vec<SubscriptionKey>,
    remote_credentials: HashMap<(String, String), RemoteCredentials>,
    last_use: Instant,
    timeout: Option<TimeoutHandle>,
}

pub struct Session {
    id: String,
    provider: Arc<dyn SessionProvider>,
    broker: Weak<MessageBroker>,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    attribute_listeners: ListenerList<dyn SessionAttributeListener>,
    destroyed_listeners: ListenerList<dyn SessionListener>,
    connectivity_listeners: ListenerList<dyn ConnectivityListener>,
    closed: CancellationToken,
}

impl Session {
    pub(crate) fn new(id: String, provider: Arc<dyn SessionProvider>, broker: Weak<MessageBroker>) -> Self {
        let connected = provider.tracks_connectivity();
        Self {
            id,
            provider,
            broker,
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                valid: true,
                invalidating: false,
                creation_notified: false,
                attributes: HashMap::new(),
                principal: None,
                connected,
                disconnected_at: None,
                client_ids: Vec::new(),
                subscriptions: Vec::new(),
                remote_credentials: HashMap::new(),
                last_use: Instant::now(),
                timeout: None,
            }),
            attribute_listeners: ListenerList::new(),
            destroyed_listeners: ListenerList::new(),
            connectivity_listeners: ListenerList::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider_kind(&self) -> &'static str {
        self.provider.kind()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    pub fn is_push_supported(&self) -> bool {
        self.provider.is_push_supported()
    }

    /// Cancelled once the session has been invalidated. Long-poll waiters select on it.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Record activity, postponing the idle timeout.
    pub fn touch(&self) {
        self.state.lock().last_use = Instant::now();
    }

    fn check_valid(&self) -> Result<(), BrokerError> {
        if self.state.lock().valid {
            Ok(())
        } else {
            Err(BrokerError::Invalidated("Session"))
        }
    }

    // -- principal ----------------------------------------------------------

    pub fn principal(&self) -> Option<Principal> {
        self.state.lock().principal.clone()
    }

    pub fn set_principal(&self, principal: Option<Principal>) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if !state.valid {
            return Err(BrokerError::Invalidated("Session"));
        }
        state.principal = principal;
        Ok(())
    }

    pub fn is_user_in_role(&self, role: &str) -> bool {
        let Some(principal) = self.principal() else {
            return false;
        };
        let roles = [role.to_string()];
        match self.broker.upgrade() {
            Some(broker) => broker.login_manager().check_roles(&principal, &roles),
            None => principal.roles.iter().any(|r| r == role),
        }
    }

    // -- attributes ---------------------------------------------------------

    pub fn get_attribute(&self, name: &str) -> Result<Option<Value>, BrokerError> {
        let state = self.state.lock();
        if !state.valid {
            return Err(BrokerError::Invalidated("Session"));
        }
        Ok(state.attributes.get(name).cloned())
    }

    /// Snapshot of the attribute names.
    pub fn attribute_names(&self) -> Result<Vec<String>, BrokerError> {
        let state = self.state.lock();
        if !state.valid {
            return Err(BrokerError::Invalidated("Session"));
        }
        Ok(state.attributes.keys().cloned().collect())
    }

    /// Set an attribute. A null value removes it.
    pub fn set_attribute(&self, name: &str, value: Value) -> Result<(), BrokerError> {
        if value.is_null() {
            self.remove_attribute(name)?;
            return Ok(());
        }
        let old = {
            let mut state = self.state.lock();
            if !state.valid {
                return Err(BrokerError::Invalidated("Session"));
            }
            state.attributes.insert(name.to_string(), value.clone())
        };

        match old {
            Some(old) => {
                self.fire(AttributeEventKind::Unbound, name, &old);
                self.fire(AttributeEventKind::Replaced, name, &old);
                self.fire(AttributeEventKind::Bound, name, &value);
            }
            None => {
                self.fire(AttributeEventKind::Bound, name, &value);
                self.fire(AttributeEventKind::Added, name, &value);
            }
        }
        Ok(())
    }

    pub fn remove_attribute(&self, name: &str) -> Result<Option<Value>, BrokerError> {
        let old = {
            let mut state = self.state.lock();
            if !state.valid {
                return Err(BrokerError::Invalidated("Session"));
            }
            state.attributes.remove(name)
        };
        if let Some(old) = &old {
            self.fire(AttributeEventKind::Unbound, name, old);
            self.fire(AttributeEventKind::Removed, name, old);
        }
        Ok(old)
    }

    fn fire(&self, kind: AttributeEventKind, name: &str, value: &Value) {
        let listeners = self.attribute_listeners.snapshot();
        if listeners.is_empty() {
            return;
        }
        let event = AttributeEvent {
            kind,
            name: name.to_string(),
            value: value.clone(),
        };
        for listener in listeners.iter() {
            listener.attribute_changed(self, &event);
        }
    }

    // -- listeners ----------------------------------------------------------

    pub fn add_attribute_listener(&self, listener: Arc<dyn SessionAttributeListener>) -> Result<(), BrokerError> {
        self.check_valid()?;
        self.attribute_listeners.add(listener);
        Ok(())
    }

    pub fn remove_attribute_listener(&self, listener: &Arc<dyn SessionAttributeListener>) {
        self.attribute_listeners.remove(listener);
    }

    pub fn add_destroyed_listener(&self, listener: Arc<dyn SessionListener>) -> Result<(), BrokerError> {
        self.check_valid()?;
        self.destroyed_listeners.add(listener);
        Ok(())
    }

    pub fn remove_destroyed_listener(&self, listener: &Arc<dyn SessionListener>) {
        self.destroyed_listeners.remove(listener);
    }

    pub fn add_connectivity_listener(&self, listener: Arc<dyn ConnectivityListener>) -> Result<(), BrokerError> {
        self.check_valid()?;
        self.connectivity_listeners.add(listener);
        Ok(())
    }

    pub fn remove_connectivity_listener(&self, listener: &Arc<dyn ConnectivityListener>) {
        self.connectivity_listeners.remove(listener);
    }

    // -- connectivity -------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub(crate) fn disconnected_for(&self, now: Instant) -> Option<Duration> {
        let state = self.state.lock();
        state.disconnected_at.map(|at| now.saturating_duration_since(at))
    }

    /// Update the live-transport flag, notifying listeners on change.
    pub fn set_connected(&self, connected: bool) {
        {
            let mut state = self.state.lock();
            if state.connected == connected || !state.valid {
                return;
            }
            state.connected = connected;
            state.disconnected_at = (!connected).then(Instant::now);
        }
        tracing::debug!(session_id = %self.id, connected, "session connectivity changed");
        for listener in self.connectivity_listeners.snapshot().iter() {
            if connected {
                listener.session_connected(self);
            } else {
                listener.session_disconnected(self);
            }
        }
    }

    // -- remote credentials -------------------------------------------------

    pub fn put_remote_credentials(&self, service_id: &str, destination_id: &str, credentials: RemoteCredentials) {
        self.state
            .lock()
            .remote_credentials
            .insert((service_id.to_string(), destination_id.to_string()), credentials);
    }

    pub fn remote_credentials(&self, service_id: &str, destination_id: &str) -> Option<RemoteCredentials> {
        self.state
            .lock()
            .remote_credentials
            .get(&(service_id.to_string(), destination_id.to_string()))
            .cloned()
    }

    pub fn clear_remote_credentials(&self, service_id: &str, destination_id: &str) {
        self.state
            .lock()
            .remote_credentials
            .remove(&(service_id.to_string(), destination_id.to_string()));
    }

    // -- associations -------------------------------------------------------

    pub fn client_ids(&self) -> Vec<String> {
        self.state.lock().client_ids.clone()
    }

    pub fn subscription_keys(&self) -> Vec<SubscriptionKey> {
        self.state.lock().subscriptions.clone()
    }

    pub(crate) fn register_client(&self, client_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if !state.valid {
            return Err(BrokerError::Invalidated("Session"));
        }
        if !state.client_ids.iter().any(|c| c == client_id) {
            state.client_ids.push(client_id.to_string());
        }
        Ok(())
    }

    pub(crate) fn unregister_client(&self, client_id: &str) {
        self.state.lock().client_ids.retain(|c| c != client_id);
    }

    pub(crate) fn register_subscription(&self, key: &SubscriptionKey) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if !state.valid || state.invalidating {
            return Err(BrokerError::Invalidated("Session"));
        }
        if !state.subscriptions.contains(key) {
            state.subscriptions.push(key.clone());
        }
        Ok(())
    }

    pub(crate) fn unregister_subscription(&self, key: &SubscriptionKey) {
        self.state.lock().subscriptions.retain(|k| k != key);
    }

    // -- lifecycle ----------------------------------------------------------

    /// Tell the registry's created listeners about this session, once.
    pub fn notify_created(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.creation_notified {
                return;
            }
            state.creation_notified = true;
        }
        if let Some(broker) = self.broker.upgrade() {
            broker.sessions().notify_created(self);
        }
    }

    /// Invalidate the session and everything it owns. Idempotent.
    pub fn invalidate(&self) {
        let timeout = {
            let mut state = self.state.lock();
            if !state.valid || state.invalidating {
                return;
            }
            state.invalidating = true;
            state.timeout.take()
        };
        let broker = self.broker.upgrade();

        if let (Some(handle), Some(broker)) = (timeout, &broker) {
            broker.timeouts().cancel(handle);
        }
        if let Some(broker) = &broker {
            broker.sessions().unregister(&self.id);
        }

        let client_ids = std::mem::take(&mut self.state.lock().client_ids);
        let subscriptions = std::mem::take(&mut self.state.lock().subscriptions);
        if let Some(broker) = &broker {
            for client_id in &client_ids {
                if let Some(client) = broker.clients().get(client_id) {
                    client.unregister_session(&self.id);
                }
            }
            for key in &subscriptions {
                if let Some(subscription) = broker.subscription(key) {
                    subscription.invalidate(false);
                }
            }
        }

        for listener in self.destroyed_listeners.drain().iter() {
            listener.session_destroyed(self);
        }

        let names: Vec<String> = self.state.lock().attributes.keys().cloned().collect();
        for name in names {
            if let Err(err) = self.remove_attribute(&name) {
                tracing::debug!(
                    session_id = %self.id,
                    attribute = %name,
                    error = %err,
                    "attribute not removed during invalidation"
                );
            }
        }

        self.provider.cleanup(self);

        {
            let mut state = self.state.lock();
            state.valid = false;
            state.invalidating = false;
            state.remote_credentials.clear();
        }
        self.attribute_listeners.drain();
        self.connectivity_listeners.drain();
        self.closed.cancel();

        tracing::info!(
            session_id = %self.id,
            provider = self.provider.kind(),
            clients = client_ids.len(),
            subscriptions = subscriptions.len(),
            "session invalidated"
        );
    }

    /// Idle timeout expired.
    pub fn timeout(&self) {
        tracing::debug!(session_id = %self.id, "session timed out");
        self.invalidate();
    }
}

impl Expirable for Session {
    fn timeout_period(&self) -> Duration {
        self.provider.session_timeout()
    }

    fn last_use(&self) -> Instant {
        self.state.lock().last_use
    }

    fn timeout(&self) {
        Session::timeout(self);
    }

    fn set_timeout_handle(&self, handle: Option<TimeoutHandle>) {
        self.state.lock().timeout = handle;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("provider", &self.provider.kind())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageBroker;
    use crate::session::provider::POLLING;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(AttributeEventKind, Value)>>,
    }

    impl SessionAttributeListener for Recorder {
        fn attribute_changed(&self, _session: &Session, event: &AttributeEvent) {
            self.events.lock().push((event.kind, event.value.clone()));
        }
    }

    #[derive(Default)]
    struct Destroyed {
        count: AtomicUsize,
        saw_attribute: Mutex<Option<Value>>,
    }

    impl SessionListener for Destroyed {
        fn session_destroyed(&self, session: &Session) {
            self.count.fetch_add(1, Ordering::SeqCst);
            // Attributes are still readable while destroy listeners run.
            *self.saw_attribute.lock() = session.get_attribute("user").ok().flatten();
        }
    }

    fn make_session() -> (Arc<MessageBroker>, Arc<Session>) {
        let broker = MessageBroker::new();
        let session = broker.sessions().create_session(POLLING).unwrap();
        (broker, session)
    }

    #[test]
    fn attribute_events_follow_bind_order() {
        let (_broker, session) = make_session();
        let recorder = Arc::new(Recorder::default());
        session.add_attribute_listener(recorder.clone()).unwrap();

        session.set_attribute("a", Value::from(1)).unwrap();
        session.set_attribute("a", Value::from(2)).unwrap();
        session.remove_attribute("a").unwrap();

        use AttributeEventKind::*;
        assert_eq!(
            *recorder.events.lock(),
            vec![
                (Bound, Value::from(1)),
                (Added, Value::from(1)),
                (Unbound, Value::from(1)),
                (Replaced, Value::from(1)),
                (Bound, Value::from(2)),
                (Unbound, Value::from(2)),
                (Removed, Value::from(2)),
            ]
        );
    }

    #[test]
    fn invalidation_removes_remaining_attributes() {
        let (_broker, session) = make_session();
        session.set_attribute("a", Value::from(1)).unwrap();
        session.set_attribute("b", Value::from(2)).unwrap();
        let recorder = Arc::new(Recorder::default());
        session.add_attribute_listener(recorder.clone()).unwrap();

        session.invalidate();

        let events = recorder.events.lock();
        let removed: Vec<_> = events
            .iter()
            .filter(|(kind, _)| *kind == AttributeEventKind::Removed)
            .map(|(_, v)| v.clone())
            .collect();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&Value::from(1)));
        assert!(removed.contains(&Value::from(2)));
    }

    #[test]
    fn null_value_removes_attribute() {
        let (_broker, session) = make_session();
        session.set_attribute("a", Value::from("x")).unwrap();
        session.set_attribute("a", Value::Null).unwrap();
        assert_eq!(session.get_attribute("a").unwrap(), None);
        assert!(session.attribute_names().unwrap().is_empty());
    }

    #[test]
    fn attribute_ops_fail_after_invalidate() {
        let (broker, session) = make_session();
        session.invalidate();
        assert!(!session.is_valid());
        assert!(matches!(
            session.get_attribute("a"),
            Err(BrokerError::Invalidated("Session"))
        ));
        assert!(session.set_attribute("a", Value::from(1)).is_err());
        assert!(session.remove_attribute("a").is_err());
        assert!(session
            .add_destroyed_listener(Arc::new(Destroyed::default()))
            .is_err());
        assert!(broker.sessions().get(session.id()).is_none());
        assert!(session.closed().is_cancelled());
    }

    #[test]
    fn destroy_listeners_fire_once_with_attributes_readable() {
        let (_broker, session) = make_session();
        let destroyed = Arc::new(Destroyed::default());
        session.add_destroyed_listener(destroyed.clone()).unwrap();
        session.set_attribute("user", Value::from("ann")).unwrap();

        session.invalidate();
        session.invalidate();
        session.timeout();

        assert_eq!(destroyed.count.load(Ordering::SeqCst), 1);
        assert_eq!(*destroyed.saw_attribute.lock(), Some(Value::from("ann")));
    }

    #[test]
    fn concurrent_invalidate_runs_one_cascade() {
        let (_broker, session) = make_session();
        let destroyed = Arc::new(Destroyed::default());
        session.add_destroyed_listener(destroyed.clone()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = session.clone();
                std::thread::spawn(move || s.invalidate())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(destroyed.count.load(Ordering::SeqCst), 1);
        assert!(!session.is_valid());
    }

    #[test]
    fn connectivity_listeners_fire_on_change_only() {
        struct Conn(AtomicUsize, AtomicUsize);
        impl ConnectivityListener for Conn {
            fn session_connected(&self, _s: &Session) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn session_disconnected(&self, _s: &Session) {
                self.1.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (_broker, session) = make_session();
        let conn = Arc::new(Conn(AtomicUsize::new(0), AtomicUsize::new(0)));
        session.add_connectivity_listener(conn.clone()).unwrap();

        session.set_connected(true);
        session.set_connected(true);
        session.set_connected(false);

        assert_eq!(conn.0.load(Ordering::SeqCst), 1);
        assert_eq!(conn.1.load(Ordering::SeqCst), 1);
        assert!(session.disconnected_for(Instant::now()).is_some());
    }

    #[test]
    fn remote_credentials_are_scoped_per_destination() {
        let (_broker, session) = make_session();
        let creds = RemoteCredentials {
            username: "u".into(),
            password: "p".into(),
            charset: None,
        };
        session.put_remote_credentials("svc", "d1", creds.clone());
        assert_eq!(session.remote_credentials("svc", "d1"), Some(creds));
        assert_eq!(session.remote_credentials("svc", "d2"), None);
        session.clear_remote_credentials("svc", "d1");
        assert_eq!(session.remote_credentials("svc", "d1"), None);
    }

    #[test]
    fn role_checks_use_principal() {
        let (_broker, session) = make_session();
        assert!(!session.is_user_in_role("admin"));
        session
            .set_principal(Some(Principal::new("ann", vec!["admin".into()])))
            .unwrap();
        assert!(session.is_user_in_role("admin"));
        assert!(!session.is_user_in_role("ops"));
    }
}
