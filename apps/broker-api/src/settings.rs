//! Parsed broker configuration: channels, services, destinations, security
//! and system settings. Loaded from JSON and validated before the broker is
//! assembled from it.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::messaging::subtopic::DEFAULT_SEPARATOR;
use crate::messaging::throttle::ThrottleSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BrokerSettings {
    pub system: SystemSettings,
    pub security: SecuritySettings,
    pub channels: Vec<ChannelSettings>,
    pub servers: Vec<ServerSettings>,
    pub services: Vec<ServiceSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SystemSettings {
    /// Reject messages whose endpoint is not among the destination's channels.
    pub enforce_endpoint_validation: bool,
    /// Idle minutes before a session times out; 0 disables.
    pub session_timeout_minutes: u64,
    /// Minutes a client identity outlives its last session; 0 destroys it immediately.
    pub client_timeout_minutes: u64,
    /// Channels advertised to clients ahead of per-service channels.
    pub default_channels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SecuritySettings {
    /// Swap the session for a fresh one after a successful login.
    pub recreate_session_after_login: bool,
    pub constraints: Vec<ConstraintSettings>,
    pub users: Vec<UserSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConstraintSettings {
    pub id: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct UserSettings {
    pub username: String,
    pub password: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    #[default]
    Polling,
    Streaming,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ChannelSettings {
    pub id: String,
    pub url: String,
    pub kind: ChannelKind,
    /// Endpoint owned by another node; described to clients but never started here.
    pub remote: bool,
    pub messaging_version: u32,
    /// Shared server this endpoint runs on.
    pub server: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerSettings {
    pub id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    #[default]
    Messaging,
    Authentication,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServiceSettings {
    pub id: String,
    pub kind: ServiceKind,
    pub destinations: Vec<DestinationSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DestinationSettings {
    pub id: String,
    /// Channels this destination accepts; empty means the default channels.
    pub channels: Vec<String>,
    pub security_constraint: Option<String>,
    pub throttle: ThrottleSettings,
    /// Idle minutes before a subscription times out; 0 disables.
    pub subscription_timeout_minutes: u64,
    pub subtopic_separator: String,
    pub allow_subtopics: bool,
    pub disallow_wildcard_subtopics: bool,
    pub reliable: bool,
}

impl Default for DestinationSettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            channels: Vec::new(),
            security_constraint: None,
            throttle: ThrottleSettings::default(),
            subscription_timeout_minutes: 0,
            subtopic_separator: DEFAULT_SEPARATOR.to_string(),
            allow_subtopics: true,
            disallow_wildcard_subtopics: false,
            reliable: false,
        }
    }
}

impl DestinationSettings {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

impl BrokerSettings {
    pub fn from_json(json: &str) -> Result<Self, BrokerError> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| BrokerError::configuration(format!("invalid broker settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, BrokerError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Settings used when no file is configured: one polling and one
    /// streaming channel in front of a messaging service with a `chat`
    /// destination.
    pub fn standalone() -> Self {
        let channel = |id: &str, kind| ChannelSettings {
            id: id.to_string(),
            url: format!("/messagebroker/{id}"),
            kind,
            ..Default::default()
        };
        Self {
            system: SystemSettings {
                session_timeout_minutes: 30,
                default_channels: vec!["my-polling".into(), "my-streaming".into()],
                ..Default::default()
            },
            channels: vec![
                channel("my-polling", ChannelKind::Polling),
                channel("my-streaming", ChannelKind::Streaming),
            ],
            services: vec![ServiceSettings {
                id: "messaging-service".into(),
                kind: ServiceKind::Messaging,
                destinations: vec![DestinationSettings::new("chat")],
            }],
            ..Default::default()
        }
    }

    /// Check ids are unique and every reference resolves.
    pub fn validate(&self) -> Result<(), BrokerError> {
        let mut channel_ids = HashSet::new();
        for channel in &self.channels {
            require_id("channel", &channel.id)?;
            if channel.url.trim().is_empty() {
                return Err(BrokerError::configuration(format!(
                    "channel '{}' has no url",
                    channel.id
                )));
            }
            if !channel_ids.insert(channel.id.as_str()) {
                return Err(duplicate("channel", &channel.id));
            }
        }

        let mut server_ids = HashSet::new();
        for server in &self.servers {
            require_id("server", &server.id)?;
            if !server_ids.insert(server.id.as_str()) {
                return Err(duplicate("server", &server.id));
            }
        }
        for channel in &self.channels {
            if let Some(server) = &channel.server {
                if !server_ids.contains(server.as_str()) {
                    return Err(BrokerError::configuration(format!(
                        "channel '{}' references unknown server '{server}'",
                        channel.id
                    )));
                }
            }
        }

        for id in &self.system.default_channels {
            if !channel_ids.contains(id.as_str()) {
                return Err(unknown_channel("default channels", id));
            }
        }

        let constraint_ids: HashSet<&str> = self
            .security
            .constraints
            .iter()
            .map(|c| c.id.as_str())
            .collect();

        let mut service_ids = HashSet::new();
        let mut destination_ids = HashSet::new();
        for service in &self.services {
            require_id("service", &service.id)?;
            if !service_ids.insert(service.id.as_str()) {
                return Err(duplicate("service", &service.id));
            }
            for dest in &service.destinations {
                require_id("destination", &dest.id)?;
                if !destination_ids.insert(dest.id.as_str()) {
                    return Err(duplicate("destination", &dest.id));
                }
                for ch in &dest.channels {
                    if !channel_ids.contains(ch.as_str()) {
                        return Err(unknown_channel(&format!("destination '{}'", dest.id), ch));
                    }
                }
                if let Some(c) = &dest.security_constraint {
                    if !constraint_ids.contains(c.as_str()) {
                        return Err(BrokerError::configuration(format!(
                            "destination '{}' references unknown security constraint '{c}'",
                            dest.id
                        )));
                    }
                }
                dest.throttle.validate(&dest.id)?;
            }
        }
        Ok(())
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
    BrokerError::configuration(format!("duplicate {kind} id '{id}'"))
}

fn unknown_channel(owner: &str, id: &str) -> BrokerError {
    BrokerError::configuration(format!("{owner} references unknown channel '{id}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "system": { "enforce-endpoint-validation": true, "default-channels": ["poll"] },
        "security": {
            "constraints": [{ "id": "traders", "roles": ["trader"] }],
            "users": [{ "username": "ann", "password": "pw", "roles": ["trader"] }]
        },
        "channels": [
            { "id": "poll", "url": "http://{server.name}/{context.root}/messagebroker/poll" },
            { "id": "stream", "url": "/messagebroker/stream", "kind": "streaming" }
        ],
        "services": [{
            "id": "messaging-service",
            "destinations": [{
                "id": "quotes",
                "channels": ["poll", "stream"],
                "security-constraint": "traders",
                "throttle": { "outbound-policy": "ignore", "max-outgoing-client-frequency": 5 }
            }]
        }]
    }"#;

    #[test]
    fn parses_sample_settings() {
        let settings = BrokerSettings::from_json(SAMPLE).unwrap();
        assert!(settings.system.enforce_endpoint_validation);
        assert_eq!(settings.channels[1].kind, ChannelKind::Streaming);
        let dest = &settings.services[0].destinations[0];
        assert_eq!(dest.subtopic_separator, ".");
        assert!(dest.allow_subtopics);
        assert_eq!(dest.throttle.max_outgoing_client_frequency, 5);
    }

    #[test]
    fn rejects_unknown_channel_reference() {
        let json = SAMPLE.replace(r#"["poll", "stream"]"#, r#"["poll", "missing"]"#);
        let err = BrokerSettings::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn rejects_duplicate_destination() {
        let mut settings = BrokerSettings::from_json(SAMPLE).unwrap();
        let dup = settings.services[0].destinations[0].clone();
        settings.services[0].destinations.push(dup);
        let err = settings.validate().unwrap_err();
        assert_eq!(err.to_string(), "duplicate destination id 'quotes'");
    }

    #[test]
    fn rejects_unknown_constraint() {
        let json = SAMPLE.replace(r#""security-constraint": "traders""#, r#""security-constraint": "nobody""#);
        assert!(BrokerSettings::from_json(&json).is_err());
    }

    #[test]
    fn standalone_settings_validate() {
        let settings = BrokerSettings::standalone();
        settings.validate().unwrap();
        assert_eq!(settings.channels.len(), 2);
        assert_eq!(settings.services[0].destinations[0].id, "chat");
    }
}
