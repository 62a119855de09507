#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use serde_json::json;

use broker_api::broker::MessageBroker;
use broker_api::config::Config;
use broker_api::message::{CommandOperation, Message};
use broker_api::security::encode_credentials;
use broker_api::settings::{
    BrokerSettings, ChannelKind, ChannelSettings, ConstraintSettings, DestinationSettings,
    SecuritySettings, ServiceKind, ServiceSettings, SystemSettings, UserSettings,
};
use broker_api::AppState;

pub const POLLING: &str = "my-polling";
pub const STREAMING: &str = "my-streaming";

/// Two channels, an open `chat` destination and a `quotes` destination
/// restricted to traders.
pub fn test_settings() -> BrokerSettings {
    let channel = |id: &str, kind| ChannelSettings {
        id: id.to_string(),
        url: format!("/messagebroker/{id}"),
        kind,
        ..Default::default()
    };
    let mut quotes = DestinationSettings::new("quotes");
    quotes.security_constraint = Some("traders".into());

    BrokerSettings {
        system: SystemSettings {
            session_timeout_minutes: 30,
            default_channels: vec![POLLING.into(), STREAMING.into()],
            ..Default::default()
        },
        security: SecuritySettings {
            recreate_session_after_login: true,
            constraints: vec![ConstraintSettings {
                id: "traders".into(),
                roles: vec!["trader".into()],
            }],
            users: vec![UserSettings {
                username: "ann".into(),
                password: "pw".into(),
                roles: vec!["trader".into()],
            }],
        },
        channels: vec![
            channel(POLLING, ChannelKind::Polling),
            channel(STREAMING, ChannelKind::Streaming),
        ],
        servers: Vec::new(),
        services: vec![ServiceSettings {
            id: "messaging-service".into(),
            kind: ServiceKind::Messaging,
            destinations: vec![DestinationSettings::new("chat"), quotes],
        }],
    }
}

/// A started broker built from [`test_settings`].
pub fn test_broker() -> Arc<MessageBroker> {
    let broker = MessageBroker::from_settings(&test_settings()).unwrap();
    broker.start().unwrap();
    broker
}

pub fn test_state() -> AppState {
    AppState {
        broker: test_broker(),
        config: Arc::new(Config::default()),
    }
}

pub fn test_app() -> (Router, AppState) {
    let state = test_state();
    let app = broker_api::transport::router().with_state(state.clone());
    (app, state)
}

pub fn ping() -> Message {
    Message::command(CommandOperation::ClientPing)
}

pub fn subscribe(destination: &str, client_id: &str) -> Message {
    Message::command(CommandOperation::Subscribe)
        .with_destination(destination)
        .with_header("DSId", client_id)
}

pub fn login(username: &str, password: &str) -> Message {
    let mut cmd = Message::command(CommandOperation::Login);
    cmd.body = json!(encode_credentials(username, password));
    cmd
}
