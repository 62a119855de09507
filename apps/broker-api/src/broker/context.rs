//! The per-request context threaded explicitly through routing and push.

use std::sync::Arc;

use crate::client::ClientIdentity;
use crate::security::Principal;
use crate::session::Session;

use super::endpoint::Endpoint;

/// Who a request (or a delivery) is on behalf of. Transports build one per
/// inbound request; server-originated work uses an empty context.
#[derive(Clone, Default)]
pub struct RequestContext {
    pub session: Option<Arc<Session>>,
    pub client: Option<Arc<ClientIdentity>>,
    pub endpoint: Option<Arc<dyn Endpoint>>,
}

impl RequestContext {
    pub fn new(
        session: Option<Arc<Session>>,
        client: Option<Arc<ClientIdentity>>,
        endpoint: Option<Arc<dyn Endpoint>>,
    ) -> Self {
        Self {
            session,
            client,
            endpoint,
        }
    }

    pub fn principal(&self) -> Option<Principal> {
        self.session.as_ref().and_then(|s| s.principal())
    }

    pub fn endpoint_id(&self) -> Option<&str> {
        self.endpoint.as_deref().map(|e| e.id())
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("session", &self.session.as_ref().map(|s| s.id().to_string()))
            .field("client", &self.client.as_ref().map(|c| c.id().to_string()))
            .field("endpoint", &self.endpoint_id())
            .finish()
    }
}
