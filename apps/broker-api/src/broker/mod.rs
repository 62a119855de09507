//! The message broker: composition root for sessions, client identities,
//! services, destinations and endpoints, and the router between them.
//!
//! Entities never hold strong references to each other. They keep ids plus a
//! `Weak<MessageBroker>` and resolve their peers through the registries here,
//! so invalidation cascades are plain lookups and nothing forms a cycle.

pub mod authentication;
pub mod context;
pub mod destination;
pub mod endpoint;
pub mod route;
pub mod server;
pub mod service;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};

use crate::client::registry::ClientRegistry;
use crate::error::BrokerError;
use crate::listeners::ListenerList;
use crate::messaging::subscription::{Subscription, SubscriptionKey};
use crate::security::LoginManager;
use crate::session::provider::{PollingSessionProvider, StreamingSessionProvider};
use crate::session::registry::SessionRegistry;
use crate::settings::{BrokerSettings, DestinationSettings};
use crate::timeout::TimeoutScheduler;

use destination::Destination;
use endpoint::{remove_tokens, without_first_segment, ChannelEndpoint, Endpoint};
use server::{RedeployWatcher, Server, SharedServer};
use service::{BuiltinServiceFactory, Factory, Service, BUILTIN_FACTORY_ID};

/// Service login and logout commands are routed to, whatever their destination.
pub const AUTHENTICATION_SERVICE_ID: &str = "authentication-service";

/// Consulted when a message names a destination no service owns yet. A
/// listener may register the destination on the spot.
pub trait ValidationListener: Send + Sync {
    fn validate_destination(&self, broker: &MessageBroker, destination_id: &str);

    /// Called before the service description is built.
    fn validate_services(&self, _broker: &MessageBroker) {}
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct MessageBrokerBuilder {
    session_timeout: Duration,
    client_timeout: Duration,
    enforce_endpoint_validation: bool,
    recreate_session_after_login: bool,
    default_channels: Vec<String>,
    login_manager: Option<LoginManager>,
    redeploy: Option<RedeployWatcher>,
}

impl Default for MessageBrokerBuilder {
    fn default() -> Self {
        Self {
            session_timeout: Duration::ZERO,
            client_timeout: Duration::ZERO,
            enforce_endpoint_validation: false,
            recreate_session_after_login: false,
            default_channels: Vec::new(),
            login_manager: None,
            redeploy: None,
        }
    }
}

impl MessageBrokerBuilder {
    /// Idle period after which polling sessions time out. Zero disables.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// How long a client identity outlives its last session. Zero destroys it immediately.
    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn enforce_endpoint_validation(mut self, enforce: bool) -> Self {
        self.enforce_endpoint_validation = enforce;
        self
    }

    pub fn recreate_session_after_login(mut self, recreate: bool) -> Self {
        self.recreate_session_after_login = recreate;
        self
    }

    pub fn default_channels(mut self, channels: Vec<String>) -> Self {
        self.default_channels = channels;
        self
    }

    pub fn login_manager(mut self, login_manager: LoginManager) -> Self {
        self.login_manager = Some(login_manager);
        self
    }

    pub fn redeploy_watcher(mut self, watcher: RedeployWatcher) -> Self {
        self.redeploy = Some(watcher);
        self
    }

    pub fn build(self) -> Arc<MessageBroker> {
        Arc::new_cyclic(|weak: &Weak<MessageBroker>| {
            let sessions = SessionRegistry::new(weak.clone());
            sessions.register_provider(Arc::new(PollingSessionProvider::new(self.session_timeout)));
            sessions.register_provider(Arc::new(StreamingSessionProvider));

            MessageBroker {
                self_ref: weak.clone(),
                enforce_endpoint_validation: self.enforce_endpoint_validation,
                recreate_session_after_login: self.recreate_session_after_login,
                default_channels: self.default_channels,
                sessions,
                clients: ClientRegistry::new(weak.clone(), self.client_timeout),
                timeouts: Arc::new(TimeoutScheduler::new()),
                login_manager: self.login_manager.unwrap_or_else(|| LoginManager::new(None)),
                services: DashMap::new(),
                destinations: DashMap::new(),
                endpoints: DashMap::new(),
                endpoint_urls: DashMap::new(),
                servers: DashMap::new(),
                factories: DashMap::new(),
                validation_listeners: ListenerList::new(),
                attribute_refs: DashMap::new(),
                redeploy: self.redeploy.map(Arc::new),
                started: AtomicBool::new(false),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

pub struct MessageBroker {
    self_ref: Weak<MessageBroker>,
    enforce_endpoint_validation: bool,
    recreate_session_after_login: bool,
    default_channels: Vec<String>,
    sessions: SessionRegistry,
    clients: ClientRegistry,
    timeouts: Arc<TimeoutScheduler>,
    login_manager: LoginManager,
    services: DashMap<String, Arc<dyn Service>>,
    /// Routing table: destination id to destination (which names its service).
    destinations: DashMap<String, Arc<Destination>>,
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
    /// Normalized endpoint URL to endpoint id.
    endpoint_urls: DashMap<String, String>,
    servers: DashMap<String, Arc<dyn Server>>,
    factories: DashMap<String, Arc<dyn Factory>>,
    validation_listeners: ListenerList<dyn ValidationListener>,
    attribute_refs: DashMap<String, usize>,
    redeploy: Option<Arc<RedeployWatcher>>,
    started: AtomicBool,
}

impl MessageBroker {
    /// A broker with default options and no services.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn builder() -> MessageBrokerBuilder {
        MessageBrokerBuilder::default()
    }

    /// Assemble a broker from validated settings: servers, endpoints, then
    /// services with their destinations. An authentication service is added
    /// when the settings do not declare one.
    pub fn from_settings(settings: &BrokerSettings) -> Result<Arc<Self>, BrokerError> {
        settings.validate()?;
        let system = &settings.system;
        let broker = Self::builder()
            .session_timeout(Duration::from_secs(system.session_timeout_minutes * 60))
            .client_timeout(Duration::from_secs(system.client_timeout_minutes * 60))
            .enforce_endpoint_validation(system.enforce_endpoint_validation)
            .recreate_session_after_login(settings.security.recreate_session_after_login)
            .default_channels(system.default_channels.clone())
            .login_manager(LoginManager::from_settings(&settings.security))
            .build();

        broker.add_factory(Arc::new(BuiltinServiceFactory))?;
        let factory = broker
            .factory(BUILTIN_FACTORY_ID)
            .ok_or_else(|| BrokerError::configuration("builtin service factory is missing"))?;

        for server in &settings.servers {
            broker.add_server(Arc::new(SharedServer::new(&server.id)))?;
        }
        for channel in &settings.channels {
            broker.add_endpoint(Arc::new(ChannelEndpoint::new(channel.clone())))?;
        }
        for service_settings in &settings.services {
            let service = factory.create_service(service_settings)?;
            broker.add_service(service)?;
            for dest in &service_settings.destinations {
                broker.create_destination(&service_settings.id, dest.clone())?;
            }
        }
        if broker.service(AUTHENTICATION_SERVICE_ID).is_none() {
            let auth = factory.create_service(&crate::settings::ServiceSettings {
                id: AUTHENTICATION_SERVICE_ID.to_string(),
                kind: crate::settings::ServiceKind::Authentication,
                destinations: Vec::new(),
            })?;
            broker.add_service(auth)?;
        }

        tracing::info!(
            services = broker.services.len(),
            destinations = broker.destinations.len(),
            endpoints = broker.endpoints.len(),
            "message broker configured"
        );
        Ok(broker)
    }

    /// Strong handle to this broker, for work that outlives the current borrow.
    pub fn handle(&self) -> Option<Arc<MessageBroker>> {
        self.self_ref.upgrade()
    }

    // -- accessors ----------------------------------------------------------

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn timeouts(&self) -> &Arc<TimeoutScheduler> {
        &self.timeouts
    }

    pub fn login_manager(&self) -> &LoginManager {
        &self.login_manager
    }

    pub fn is_enforcing_endpoint_validation(&self) -> bool {
        self.enforce_endpoint_validation
    }

    pub fn default_channels(&self) -> &[String] {
        &self.default_channels
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    // -- registration -------------------------------------------------------

    pub fn add_service(&self, service: Arc<dyn Service>) -> Result<(), BrokerError> {
        let id = service.id().to_string();
        require_id("service", &id)?;
        match self.services.entry(id) {
            Entry::Occupied(e) if Arc::ptr_eq(e.get(), &service) => return Ok(()),
            Entry::Occupied(e) => return Err(duplicate("service", e.key())),
            Entry::Vacant(e) => {
                e.insert(Arc::clone(&service));
            }
        }
        // Destinations attached before registration join the routing table now.
        for destination in service.destinations() {
            self.register_destination(&destination)?;
        }
        if self.is_started() {
            service.start()?;
        }
        tracing::debug!(service = %service.id(), "service registered");
        Ok(())
    }

    pub fn service(&self, id: &str) -> Option<Arc<dyn Service>> {
        self.services.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.services.iter().map(|s| s.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Services sorted by id, for deterministic lifecycle and description order.
    fn sorted_services(&self) -> Vec<Arc<dyn Service>> {
        self.service_ids()
            .iter()
            .filter_map(|id| self.service(id))
            .collect()
    }

    /// Create a destination from settings and attach it to `service_id`.
    pub fn create_destination(
        &self,
        service_id: &str,
        settings: DestinationSettings,
    ) -> Result<Arc<Destination>, BrokerError> {
        let service = self.service(service_id).ok_or_else(|| {
            BrokerError::configuration(format!(
                "cannot add destination '{}' to unknown service '{service_id}'",
                settings.id
            ))
        })?;
        if let Some(constraint) = &settings.security_constraint {
            if self.login_manager.constraint(constraint).is_none() {
                return Err(BrokerError::configuration(format!(
                    "destination '{}' references unknown security constraint '{constraint}'",
                    settings.id
                )));
            }
        }
        let destination = Arc::new(Destination::new(&settings, service_id, self.self_ref.clone())?);
        self.register_destination(&destination)?;
        if let Err(err) = service.add_destination(Arc::clone(&destination)) {
            self.unregister_destination(destination.id());
            return Err(err);
        }
        tracing::debug!(destination = %destination.id(), service = %service_id, "destination created");
        Ok(destination)
    }

    /// Add a destination to the routing table. Ids are unique across services.
    pub fn register_destination(&self, destination: &Arc<Destination>) -> Result<(), BrokerError> {
        require_id("destination", destination.id())?;
        match self.destinations.entry(destination.id().to_string()) {
            Entry::Occupied(e) if Arc::ptr_eq(e.get(), destination) => Ok(()),
            Entry::Occupied(e) => Err(BrokerError::configuration(format!(
                "cannot add destination with id '{}' to service with id '{}' because another service with id '{}' already has a destination with the same id",
                destination.id(),
                destination.service_id(),
                e.get().service_id()
            ))),
            Entry::Vacant(e) => {
                e.insert(Arc::clone(destination));
                Ok(())
            }
        }
    }

    pub fn unregister_destination(&self, id: &str) -> Option<Arc<Destination>> {
        self.destinations.remove(id).map(|(_, d)| d)
    }

    pub fn destination(&self, id: &str) -> Option<Arc<Destination>> {
        self.destinations.get(id).map(|d| Arc::clone(d.value()))
    }

    /// Service that owns `destination_id`, per the routing table.
    pub fn service_for_destination(&self, destination_id: &str) -> Option<String> {
        self.destinations
            .get(destination_id)
            .map(|d| d.service_id().to_string())
    }

    pub fn subscription(&self, key: &SubscriptionKey) -> Option<Arc<Subscription>> {
        self.destination(&key.destination_id)?
            .subscriptions()
            .subscription(&key.client_id)
    }

    /// Register an endpoint. Its normalized URL must not collide with one
    /// already registered, with or without a leading path segment.
    pub fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) -> Result<(), BrokerError> {
        let id = endpoint.id().to_string();
        require_id("endpoint", &id)?;
        if let Some(existing) = self.endpoints.get(&id) {
            if Arc::ptr_eq(existing.value(), &endpoint) {
                return Ok(());
            }
            return Err(duplicate("endpoint", &id));
        }
        self.check_endpoint_url(&id, endpoint.url())?;
        if self.is_started() && !endpoint.is_remote() {
            endpoint.start()?;
        }
        self.endpoints.insert(id, endpoint);
        Ok(())
    }

    fn check_endpoint_url(&self, id: &str, url: &str) -> Result<(), BrokerError> {
        if url.trim().is_empty() {
            return Err(BrokerError::configuration(format!("endpoint '{id}' has no url")));
        }
        let parsed = remove_tokens(url);
        let mut candidates = vec![parsed.clone()];
        if let Some(rest) = without_first_segment(&parsed) {
            candidates.push(rest.to_string());
        }
        for candidate in &candidates {
            if let Some(owner) = self.endpoint_urls.get(candidate) {
                return Err(BrokerError::configuration(format!(
                    "endpoint '{id}' url '{url}' collides with the url of endpoint '{}'",
                    owner.value()
                )));
            }
        }
        for candidate in candidates {
            self.endpoint_urls.insert(candidate, id.to_string());
        }
        Ok(())
    }

    pub fn endpoint(&self, id: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn endpoint_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn add_server(&self, server: Arc<dyn Server>) -> Result<(), BrokerError> {
        let id = server.id().to_string();
        require_id("server", &id)?;
        match self.servers.entry(id) {
            Entry::Occupied(e) if Arc::ptr_eq(e.get(), &server) => Ok(()),
            Entry::Occupied(e) => Err(duplicate("server", e.key())),
            Entry::Vacant(e) => {
                if self.is_started() {
                    server.start()?;
                }
                e.insert(server);
                Ok(())
            }
        }
    }

    pub fn server(&self, id: &str) -> Option<Arc<dyn Server>> {
        self.servers.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn add_factory(&self, factory: Arc<dyn Factory>) -> Result<(), BrokerError> {
        let id = factory.id().to_string();
        require_id("factory", &id)?;
        match self.factories.entry(id) {
            Entry::Occupied(e) if Arc::ptr_eq(e.get(), &factory) => Ok(()),
            Entry::Occupied(e) => Err(duplicate("factory", e.key())),
            Entry::Vacant(e) => {
                e.insert(factory);
                Ok(())
            }
        }
    }

    pub fn factory(&self, id: &str) -> Option<Arc<dyn Factory>> {
        self.factories.get(id).map(|f| Arc::clone(f.value()))
    }

    pub fn add_validation_listener(&self, listener: Arc<dyn ValidationListener>) {
        self.validation_listeners.add(listener);
    }

    pub fn remove_validation_listener(&self, listener: &Arc<dyn ValidationListener>) {
        self.validation_listeners.remove(listener);
    }

    // -- attribute id reference counts --------------------------------------

    /// Count one more user of a session attribute id. Returns the new count.
    pub fn increment_attribute_id_ref_count(&self, attribute_id: &str) -> usize {
        let mut count = self.attribute_refs.entry(attribute_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Release one user of an attribute id. The entry is dropped at zero.
    pub fn decrement_attribute_id_ref_count(&self, attribute_id: &str) -> usize {
        let remaining = match self.attribute_refs.get_mut(attribute_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return 0,
        };
        if remaining == 0 {
            self.attribute_refs.remove_if(attribute_id, |_, c| *c == 0);
        }
        remaining
    }

    // -- description --------------------------------------------------------

    /// Service and channel configuration a client needs at bootstrap. With an
    /// endpoint, only destinations reachable through it are described.
    pub fn describe_services(&self, endpoint_id: Option<&str>, only_reliable: bool) -> Value {
        for listener in self.validation_listeners.snapshot().iter() {
            listener.validate_services(self);
        }

        let mut channel_ids: Vec<String> = match endpoint_id {
            Some(id) => vec![id.to_string()],
            None => self.endpoint_ids(),
        };

        let mut description = serde_json::Map::new();
        if !self.default_channels.is_empty() {
            for id in &self.default_channels {
                if !channel_ids.contains(id) {
                    channel_ids.push(id.clone());
                }
            }
            description.insert("defaultChannels".into(), json!(self.default_channels));
        }

        let services: Vec<Value> = self
            .sorted_services()
            .iter()
            .filter_map(|s| s.describe(endpoint_id, only_reliable))
            .collect();
        if !services.is_empty() {
            description.insert("services".into(), Value::Array(services));
        }

        // Remote channels are configured on the client by other means.
        let channels: Vec<Value> = channel_ids
            .iter()
            .filter_map(|id| self.endpoint(id))
            .filter(|e| !e.is_remote())
            .map(|e| e.describe())
            .collect();
        if !channels.is_empty() {
            description.insert("channels".into(), Value::Array(channels));
        }
        Value::Object(description)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Start sessions, clients, services, login manager, local endpoints,
    /// shared servers and the redeploy watcher, in that order.
    pub fn start(&self) -> Result<(), BrokerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.start_components() {
            tracing::error!(error = %err.chain(), code = err.code(), "message broker failed to start");
            self.started.store(false, Ordering::SeqCst);
            return Err(err);
        }
        tracing::info!(
            services = self.services.len(),
            endpoints = self.endpoints.len(),
            "message broker started"
        );
        Ok(())
    }

    fn start_components(&self) -> Result<(), BrokerError> {
        self.sessions.start();
        self.clients.start();
        for service in self.sorted_services() {
            service.start()?;
        }
        self.login_manager.start();

        for id in self.endpoint_ids() {
            let Some(endpoint) = self.endpoint(&id) else { continue };
            if endpoint.is_remote() {
                tracing::debug!(endpoint = %id, "remote endpoint not started");
                continue;
            }
            endpoint.start()?;
        }

        let servers: Vec<Arc<dyn Server>> = self.servers.iter().map(|s| Arc::clone(s.value())).collect();
        for server in servers {
            let referenced = self
                .endpoints
                .iter()
                .any(|e| e.value().server_id() == Some(server.id()));
            if !referenced {
                tracing::warn!(server = %server.id(), "shared server is not referenced by any endpoint");
            }
            server.start()?;
        }

        if let Some(watcher) = &self.redeploy {
            watcher.start();
        }
        Ok(())
    }

    /// Stop everything in reverse start order and drop cached registrations.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(watcher) = &self.redeploy {
            watcher.stop();
        }
        for server in self.servers.iter() {
            server.value().stop();
        }
        for endpoint in self.endpoints.iter() {
            if !endpoint.value().is_remote() {
                endpoint.value().stop();
            }
        }
        self.login_manager.stop();
        for service in self.sorted_services().iter().rev() {
            service.stop();
        }
        self.clients.stop();
        self.sessions.stop();
        self.attribute_refs.clear();
        tracing::info!("message broker stopped");
    }
}

impl std::fmt::Debug for MessageBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBroker")
            .field("started", &self.is_started())
            .field("services", &self.service_ids())
            .field("endpoints", &self.endpoint_ids())
            .field("sessions", &self.sessions.len())
            .field("clients", &self.clients.len())
            .finish()
    }
}

fn require_id(kind: &str, id: &str) -> Result<(), BrokerError> {
    if id.trim().is_empty() {
        Err(BrokerError::configuration(format!("{kind} id must not be empty")))
    } else {
        Ok(())
    }
}

fn duplicate(kind: &str, id: &str) -> BrokerError {
    BrokerError::configuration(format!("{kind} with id '{id}' is already registered"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::service::MessageService;
    use crate::settings::{ChannelKind, ChannelSettings};

    fn channel(id: &str, url: &str) -> Arc<dyn Endpoint> {
        Arc::new(ChannelEndpoint::new(ChannelSettings {
            id: id.into(),
            url: url.into(),
            kind: ChannelKind::Polling,
            ..Default::default()
        }))
    }

    #[test]
    fn duplicate_destination_names_both_services() {
        let broker = MessageBroker::new();
        broker.add_service(Arc::new(MessageService::new("svc-a"))).unwrap();
        broker.add_service(Arc::new(MessageService::new("svc-b"))).unwrap();
        let quotes = broker
            .create_destination("svc-a", DestinationSettings::new("quotes"))
            .unwrap();

        let err = broker
            .create_destination("svc-b", DestinationSettings::new("quotes"))
            .unwrap_err();
        let text = err.to_string();
        assert_eq!(err.code(), crate::error::CONFIGURATION_ERROR);
        assert!(text.contains("svc-a") && text.contains("svc-b"), "{text}");

        broker.register_destination(&quotes).unwrap();
        assert_eq!(broker.service_for_destination("quotes").as_deref(), Some("svc-a"));
    }

    #[test]
    fn same_service_instance_is_a_noop() {
        let broker = MessageBroker::new();
        let svc: Arc<dyn Service> = Arc::new(MessageService::new("svc"));
        broker.add_service(Arc::clone(&svc)).unwrap();
        broker.add_service(Arc::clone(&svc)).unwrap();
        assert!(broker
            .add_service(Arc::new(MessageService::new("svc")))
            .is_err());
    }

    #[test]
    fn endpoint_urls_are_unique_after_normalization() {
        let broker = MessageBroker::new();
        broker
            .add_endpoint(channel("a", "http://{server.name}/{context.root}/messagebroker/amf"))
            .unwrap();
        let err = broker
            .add_endpoint(channel("b", "/messagebroker/amf/"))
            .unwrap_err();
        assert!(err.to_string().contains("'a'"));

        // A literal context root collides with the tokenized form.
        let err = broker
            .add_endpoint(channel("c", "https://host/app/messagebroker/amf"))
            .unwrap_err();
        assert_eq!(err.code(), crate::error::CONFIGURATION_ERROR);

        broker.add_endpoint(channel("d", "/messagebroker/poll")).unwrap();
        assert!(broker.add_endpoint(channel("d", "/other")).is_err());
    }

    #[test]
    fn attribute_id_refs_count_down_to_zero() {
        let broker = MessageBroker::new();
        assert_eq!(broker.increment_attribute_id_ref_count("cart"), 1);
        assert_eq!(broker.increment_attribute_id_ref_count("cart"), 2);
        assert_eq!(broker.decrement_attribute_id_ref_count("cart"), 1);
        assert_eq!(broker.decrement_attribute_id_ref_count("cart"), 0);
        assert_eq!(broker.decrement_attribute_id_ref_count("cart"), 0);
    }

    #[test]
    fn start_skips_remote_endpoints_and_stop_reverses() {
        let broker = MessageBroker::new();
        let local = channel("local", "/messagebroker/local");
        let remote: Arc<dyn Endpoint> = Arc::new(ChannelEndpoint::new(ChannelSettings {
            id: "remote".into(),
            url: "/messagebroker/remote".into(),
            remote: true,
            ..Default::default()
        }));
        broker.add_endpoint(Arc::clone(&local)).unwrap();
        broker.add_endpoint(Arc::clone(&remote)).unwrap();
        let svc: Arc<dyn Service> = Arc::new(MessageService::new("svc"));
        broker.add_service(Arc::clone(&svc)).unwrap();

        broker.start().unwrap();
        assert!(local.is_started());
        assert!(!remote.is_started());
        assert!(svc.is_started());
        assert!(broker.login_manager().is_started());

        broker.stop();
        assert!(!local.is_started());
        assert!(!svc.is_started());
        assert!(!broker.is_started());
    }

    #[test]
    fn describe_lists_defaults_services_and_local_channels() {
        let broker = MessageBroker::builder()
            .default_channels(vec!["poll".into()])
            .build();
        broker.add_endpoint(channel("poll", "/messagebroker/poll")).unwrap();
        broker
            .add_endpoint(Arc::new(ChannelEndpoint::new(ChannelSettings {
                id: "far".into(),
                url: "/messagebroker/far".into(),
                remote: true,
                ..Default::default()
            })))
            .unwrap();
        broker.add_service(Arc::new(MessageService::new("svc"))).unwrap();
        let mut settings = DestinationSettings::new("quotes");
        settings.channels = vec!["poll".into()];
        broker.create_destination("svc", settings).unwrap();

        let described = broker.describe_services(None, false);
        assert_eq!(described["defaultChannels"], json!(["poll"]));
        assert_eq!(described["services"][0]["destinations"][0]["id"], "quotes");
        let channels = described["channels"].as_array().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0]["id"], "poll");

        // Unreliable destinations are left out on request.
        assert!(broker.describe_services(None, true).get("services").is_none());
    }

    #[test]
    fn from_settings_adds_authentication_service() {
        let settings = BrokerSettings::from_json(
            r#"{
                "channels": [{ "id": "poll", "url": "/messagebroker/poll" }],
                "services": [{ "id": "messaging-service", "destinations": [{ "id": "chat" }] }]
            }"#,
        )
        .unwrap();
        let broker = MessageBroker::from_settings(&settings).unwrap();
        assert!(broker.service(AUTHENTICATION_SERVICE_ID).is_some());
        assert_eq!(
            broker.service_for_destination("chat").as_deref(),
            Some("messaging-service")
        );
        assert!(broker.endpoint("poll").is_some());
    }
}
