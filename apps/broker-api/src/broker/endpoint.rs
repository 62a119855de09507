//! Endpoints: the channels clients reach the broker through, and the URL
//! normalization used to keep their addresses unique.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{json, Value};

use crate::error::BrokerError;
use crate::session::provider::{POLLING, STREAMING};
use crate::settings::{ChannelKind, ChannelSettings};

/// Messaging protocol version reported when a channel does not set one.
pub const DEFAULT_MESSAGING_VERSION: u32 = 1;

const CONTEXT_ROOT: &str = "{context.root}";

pub trait Endpoint: Send + Sync {
    fn id(&self) -> &str;

    fn url(&self) -> &str;

    /// Kind of the session provider requests on this endpoint are bound to.
    fn session_kind(&self) -> &'static str;

    fn messaging_version(&self) -> u32 {
        DEFAULT_MESSAGING_VERSION
    }

    /// Endpoint owned by another node. Described to clients, never started here.
    fn is_remote(&self) -> bool {
        false
    }

    /// Shared server this endpoint runs on.
    fn server_id(&self) -> Option<&str> {
        None
    }

    fn is_started(&self) -> bool;

    fn start(&self) -> Result<(), BrokerError>;

    fn stop(&self);

    /// Channel description handed to clients at bootstrap.
    fn describe(&self) -> Value {
        json!({
            "id": self.id(),
            "url": self.url(),
            "kind": self.session_kind(),
            "messagingVersion": self.messaging_version(),
        })
    }
}

/// Endpoint built from a configured channel.
pub struct ChannelEndpoint {
    settings: ChannelSettings,
    started: AtomicBool,
}

impl ChannelEndpoint {
    pub fn new(settings: ChannelSettings) -> Self {
        Self {
            settings,
            started: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.settings.kind
    }
}

impl Endpoint for ChannelEndpoint {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn url(&self) -> &str {
        &self.settings.url
    }

    fn session_kind(&self) -> &'static str {
        match self.settings.kind {
            ChannelKind::Polling => POLLING,
            ChannelKind::Streaming => STREAMING,
        }
    }

    fn messaging_version(&self) -> u32 {
        match self.settings.messaging_version {
            0 => DEFAULT_MESSAGING_VERSION,
            v => v,
        }
    }

    fn is_remote(&self) -> bool {
        self.settings.remote
    }

    fn server_id(&self) -> Option<&str> {
        self.settings.server.as_deref()
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn start(&self) -> Result<(), BrokerError> {
        if !self.started.swap(true, Ordering::SeqCst) {
            tracing::info!(endpoint = %self.settings.id, url = %self.settings.url, "endpoint started");
        }
        Ok(())
    }

    fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            tracing::info!(endpoint = %self.settings.id, "endpoint stopped");
        }
    }
}

/// Reduce an endpoint URL to the part that identifies it on this server:
/// lowercased, without scheme and host, without a leading context root token
/// and without a trailing slash.
pub fn remove_tokens(url: &str) -> String {
    let mut parsed = url.trim().to_lowercase();

    let has_scheme = ["http://", "https://", "rtmp://", "rtmps://"]
        .iter()
        .any(|scheme| parsed.starts_with(scheme));
    if has_scheme {
        // Scheme-relative search starts past "https://".
        if let Some(idx) = parsed.get(8..).and_then(|rest| rest.find('/')).map(|i| i + 8) {
            if idx != parsed.len() - 1 {
                parsed = parsed[idx..].to_string();
            }
        }
    }

    parsed = parsed.replace("{context-root}", CONTEXT_ROOT);
    if let Some(rest) = parsed.strip_prefix(CONTEXT_ROOT) {
        parsed = rest.to_string();
    } else if let Some(rest) = parsed
        .strip_prefix('/')
        .and_then(|p| p.strip_prefix(CONTEXT_ROOT))
    {
        parsed = rest.to_string();
    }

    if parsed.ends_with('/') {
        parsed.pop();
    }
    parsed
}

/// The normalized URL with its first path segment removed, for matching a
/// URL that spells out a literal context root against one that uses the token.
pub(crate) fn without_first_segment(parsed: &str) -> Option<&str> {
    parsed.get(1..)?.find('/').map(|i| &parsed[i + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scheme_host_and_context_root() {
        assert_eq!(
            remove_tokens("http://{server.name}:{server.port}/{context.root}/messagebroker/amf"),
            "/messagebroker/amf"
        );
        assert_eq!(
            remove_tokens("HTTPS://example.com/{context-root}/MessageBroker/Poll/"),
            "/messagebroker/poll"
        );
        assert_eq!(remove_tokens("/messagebroker/stream"), "/messagebroker/stream");
        assert_eq!(remove_tokens("{context.root}/mb"), "/mb");
    }

    #[test]
    fn host_only_url_is_kept() {
        assert_eq!(remove_tokens("http://localhost/"), "http://localhost");
    }

    #[test]
    fn literal_context_root_is_skipped() {
        assert_eq!(
            without_first_segment("/app/messagebroker/amf"),
            Some("/messagebroker/amf")
        );
        assert_eq!(without_first_segment("/amf"), None);
    }

    #[test]
    fn channel_kind_selects_provider() {
        let endpoint = ChannelEndpoint::new(ChannelSettings {
            id: "stream".into(),
            url: "/messagebroker/stream".into(),
            kind: ChannelKind::Streaming,
            ..Default::default()
        });
        assert_eq!(endpoint.session_kind(), STREAMING);
        assert_eq!(endpoint.messaging_version(), DEFAULT_MESSAGING_VERSION);
        assert!(!endpoint.is_started());
        endpoint.start().unwrap();
        assert!(endpoint.is_started());
    }
}
