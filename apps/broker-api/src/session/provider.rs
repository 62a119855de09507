//! Session providers: the per-transport strategy a session delegates its
//! push capability, connectivity tracking and teardown to.

use std::time::Duration;

use super::Session;

pub const POLLING: &str = "polling";
pub const STREAMING: &str = "streaming";

pub trait SessionProvider: Send + Sync {
    /// Registry key; endpoints refer to providers by kind.
    fn kind(&self) -> &'static str;

    /// Idle period after which sessions time out. Zero disables.
    fn session_timeout(&self) -> Duration {
        Duration::ZERO
    }

    /// Whether the server can push to a session without a client request.
    fn is_push_supported(&self) -> bool {
        false
    }

    /// Whether sessions track a live connection.
    fn tracks_connectivity(&self) -> bool {
        false
    }

    /// Whether a session may be swapped for a fresh one after login.
    fn supports_recreation(&self) -> bool {
        false
    }

    /// Transport-specific teardown, called once attributes are unbound.
    fn cleanup(&self, _session: &Session) {}

    fn start(&self) {}

    fn stop(&self) {}
}

/// Request/response sessions identified by a header on each request.
pub struct PollingSessionProvider {
    timeout: Duration,
}

impl PollingSessionProvider {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl SessionProvider for PollingSessionProvider {
    fn kind(&self) -> &'static str {
        POLLING
    }

    fn session_timeout(&self) -> Duration {
        self.timeout
    }

    fn supports_recreation(&self) -> bool {
        true
    }

    fn cleanup(&self, session: &Session) {
        tracing::trace!(session_id = %session.id(), "polling session released");
    }
}

/// Sessions bound to one live socket. They end with the connection rather
/// than on an idle timer.
#[derive(Default)]
pub struct StreamingSessionProvider;

impl SessionProvider for StreamingSessionProvider {
    fn kind(&self) -> &'static str {
        STREAMING
    }

    fn is_push_supported(&self) -> bool {
        true
    }

    fn tracks_connectivity(&self) -> bool {
        true
    }

    fn cleanup(&self, session: &Session) {
        session.set_connected(false);
    }
}
