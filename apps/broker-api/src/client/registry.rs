//! Registry of client identities, keyed by client id.

use std::sync::{Arc, Weak};
use std::time::Duration;

use broker_common::id::{prefix, prefixed_ulid};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::broker::MessageBroker;
use crate::error::BrokerError;
use crate::listeners::ListenerList;

use super::{ClientIdentity, ClientListener};

pub struct ClientRegistry {
    broker: Weak<MessageBroker>,
    clients: DashMap<String, Arc<ClientIdentity>>,
    timeout: Duration,
    created_listeners: ListenerList<dyn ClientListener>,
}

impl ClientRegistry {
    pub(crate) fn new(broker: Weak<MessageBroker>, timeout: Duration) -> Self {
        Self {
            broker,
            clients: DashMap::new(),
            timeout,
            created_listeners: ListenerList::new(),
        }
    }

    /// Orphan timeout applied to new identities.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Look up `id`, creating the identity when it is unknown. A `None` id
    /// gets a server-generated one.
    pub fn get_or_create(&self, id: Option<&str>) -> Result<Arc<ClientIdentity>, BrokerError> {
        let id = match id {
            Some(id) if id.trim().is_empty() => {
                return Err(BrokerError::routing("client id must not be blank"));
            }
            Some(id) => id.to_string(),
            None => prefixed_ulid(prefix::CLIENT),
        };

        let client = match self.clients.entry(id) {
            Entry::Occupied(e) => return Ok(Arc::clone(e.get())),
            Entry::Vacant(e) => {
                let client = Arc::new(ClientIdentity::new(
                    e.key().clone(),
                    self.broker.clone(),
                    self.timeout,
                ));
                e.insert(Arc::clone(&client));
                client
            }
        };

        tracing::info!(client_id = %client.id(), "client created");
        for listener in self.created_listeners.snapshot().iter() {
            listener.client_created(&client);
        }
        Ok(client)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClientIdentity>> {
        self.clients.get(id).map(|c| Arc::clone(c.value()))
    }

    pub(crate) fn remove(&self, id: &str) {
        self.clients.remove(id);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn add_created_listener(&self, listener: Arc<dyn ClientListener>) {
        self.created_listeners.add(listener);
    }

    pub fn remove_created_listener(&self, listener: &Arc<dyn ClientListener>) {
        self.created_listeners.remove(listener);
    }

    pub fn start(&self) {
        tracing::debug!(timeout_secs = self.timeout.as_secs(), "client registry started");
    }

    /// Invalidate every identity.
    pub fn stop(&self) {
        let clients: Vec<Arc<ClientIdentity>> = self.clients.iter().map(|e| Arc::clone(e.value())).collect();
        for client in clients {
            client.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Created(AtomicUsize);

    impl ClientListener for Created {
        fn client_created(&self, _client: &Arc<ClientIdentity>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn get_or_create_reuses_existing() {
        let broker = MessageBroker::new();
        let created = Arc::new(Created::default());
        broker.clients().add_created_listener(created.clone());

        let a = broker.clients().get_or_create(Some("c-1")).unwrap();
        let b = broker.clients().get_or_create(Some("c-1")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(created.0.load(Ordering::SeqCst), 1);

        let generated = broker.clients().get_or_create(None).unwrap();
        assert!(generated.id().starts_with("cli_"));
        assert_eq!(broker.clients().len(), 2);
    }

    #[test]
    fn blank_id_is_rejected() {
        let broker = MessageBroker::new();
        assert!(broker.clients().get_or_create(Some("  ")).is_err());
    }

    #[test]
    fn stop_invalidates_all() {
        let broker = MessageBroker::new();
        let a = broker.clients().get_or_create(None).unwrap();
        broker.clients().stop();
        assert!(!a.is_valid());
        assert!(broker.clients().is_empty());
    }
}
