pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod listeners;
pub mod message;
pub mod messaging;
pub mod security;
pub mod session;
pub mod settings;
pub mod timeout;
pub mod transport;

use std::sync::Arc;

use broker::MessageBroker;
use config::Config;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<MessageBroker>,
    pub config: Arc<Config>,
}
