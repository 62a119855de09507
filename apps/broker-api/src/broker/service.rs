//! Service contract, the shared destination bookkeeping services build on,
//! and the factory seam used to assemble services from settings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};

use crate::error::BrokerError;
use crate::message::Message;
use crate::messaging::service::MessageService;
use crate::settings::{ServiceKind, ServiceSettings};

use super::authentication::AuthenticationService;
use super::context::RequestContext;
use super::destination::Destination;
use super::MessageBroker;

/// What a service hands back for a message or command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Empty,
    Body(Value),
    Message(Message),
}

/// Destination ids and lifecycle state shared by every service.
pub struct ServiceCore {
    id: String,
    destinations: DashMap<String, Arc<Destination>>,
    started: AtomicBool,
}

impl ServiceCore {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            destinations: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }
}

pub trait Service: Send + Sync {
    fn core(&self) -> &ServiceCore;

    fn service_message(
        &self,
        broker: &MessageBroker,
        ctx: &mut RequestContext,
        message: &Message,
    ) -> Result<Reply, BrokerError>;

    fn service_command(
        &self,
        broker: &MessageBroker,
        ctx: &mut RequestContext,
        command: &Message,
    ) -> Result<Reply, BrokerError>;

    fn id(&self) -> &str {
        &self.core().id
    }

    fn destination(&self, id: &str) -> Option<Arc<Destination>> {
        self.core().destinations.get(id).map(|d| Arc::clone(d.value()))
    }

    fn destinations(&self) -> Vec<Arc<Destination>> {
        let mut all: Vec<Arc<Destination>> = self
            .core()
            .destinations
            .iter()
            .map(|d| Arc::clone(d.value()))
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Attach a destination. Re-adding the same instance is a no-op.
    fn add_destination(&self, destination: Arc<Destination>) -> Result<(), BrokerError> {
        let core = self.core();
        if let Some(existing) = core.destinations.get(destination.id()) {
            if Arc::ptr_eq(existing.value(), &destination) {
                return Ok(());
            }
            return Err(BrokerError::configuration(format!(
                "service '{}' already has a destination with id '{}'",
                core.id,
                destination.id()
            )));
        }
        if self.is_started() {
            destination.start();
        }
        core.destinations
            .insert(destination.id().to_string(), destination);
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.core().started.load(Ordering::SeqCst)
    }

    fn start(&self) -> Result<(), BrokerError> {
        let core = self.core();
        if core.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for destination in core.destinations.iter() {
            destination.value().start();
        }
        tracing::info!(service = %core.id, destinations = core.destinations.len(), "service started");
        Ok(())
    }

    fn stop(&self) {
        let core = self.core();
        if !core.started.swap(false, Ordering::SeqCst) {
            return;
        }
        for destination in self.destinations() {
            destination.stop();
        }
        tracing::info!(service = %core.id, "service stopped");
    }

    /// Client bootstrap description. Destinations that do not accept
    /// `endpoint_id` are left out, as are unreliable ones when `only_reliable`.
    fn describe(&self, endpoint_id: Option<&str>, only_reliable: bool) -> Option<Value> {
        let destinations: Vec<Value> = self
            .destinations()
            .iter()
            .filter(|d| !only_reliable || d.is_reliable())
            .filter(|d| match endpoint_id {
                Some(endpoint) => d.channels().is_empty() || d.channels().iter().any(|c| c == endpoint),
                None => true,
            })
            .map(|d| d.describe())
            .collect();
        if destinations.is_empty() {
            return None;
        }
        Some(json!({
            "id": self.id(),
            "destinations": destinations,
        }))
    }
}

/// Builds services from their settings.
pub trait Factory: Send + Sync {
    fn id(&self) -> &str;

    fn create_service(&self, settings: &ServiceSettings) -> Result<Arc<dyn Service>, BrokerError>;
}

pub const BUILTIN_FACTORY_ID: &str = "builtin";

/// Creates the services shipped with the broker.
pub struct BuiltinServiceFactory;

impl Factory for BuiltinServiceFactory {
    fn id(&self) -> &str {
        BUILTIN_FACTORY_ID
    }

    fn create_service(&self, settings: &ServiceSettings) -> Result<Arc<dyn Service>, BrokerError> {
        if settings.id.is_empty() {
            return Err(BrokerError::configuration("service id must not be empty"));
        }
        let service: Arc<dyn Service> = match settings.kind {
            ServiceKind::Messaging => Arc::new(MessageService::new(&settings.id)),
            ServiceKind::Authentication => Arc::new(AuthenticationService::new(&settings.id)),
        };
        tracing::debug!(service = %settings.id, kind = ?settings.kind, "service created");
        Ok(service)
    }
}
