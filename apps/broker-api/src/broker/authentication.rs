//! Login and logout commands, always routed here regardless of destination.

use serde_json::{json, Value};

use crate::error::BrokerError;
use crate::message::{CommandOperation, Message};

use super::context::RequestContext;
use super::service::{Reply, Service, ServiceCore};
use super::MessageBroker;

pub struct AuthenticationService {
    core: ServiceCore,
}

impl AuthenticationService {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            core: ServiceCore::new(id),
        }
    }
}

impl Service for AuthenticationService {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    fn service_message(
        &self,
        _broker: &MessageBroker,
        _ctx: &mut RequestContext,
        _message: &Message,
    ) -> Result<Reply, BrokerError> {
        Err(BrokerError::Unsupported(format!(
            "service '{}' does not accept data messages",
            self.id()
        )))
    }

    fn service_command(
        &self,
        broker: &MessageBroker,
        ctx: &mut RequestContext,
        command: &Message,
    ) -> Result<Reply, BrokerError> {
        let session = ctx
            .session
            .clone()
            .ok_or_else(|| BrokerError::routing("login and logout require a session"))?;
        match command.operation() {
            CommandOperation::Login => {
                let credentials = match &command.body {
                    Value::String(encoded) => encoded.as_str(),
                    _ => return Err(BrokerError::invalid_credentials("login body must be encoded credentials")),
                };
                let principal = broker.login_manager().login_session(&session, credentials)?;
                Ok(Reply::Body(json!({ "principal": principal.name })))
            }
            CommandOperation::Logout => {
                broker.login_manager().logout(&session)?;
                Ok(Reply::Body(json!("success")))
            }
            other => Err(BrokerError::Unsupported(format!(
                "service '{}' does not handle command operation {}",
                self.id(),
                other.code()
            ))),
        }
    }
}
