//! Routing: inbound messages and commands to services, and pushes from
//! services to subscribed client identities.

use std::sync::Arc;

use base64::Engine;

use crate::client::queue::Enqueued;
use crate::client::ClientIdentity;
use crate::error::BrokerError;
use crate::message::{headers, CommandOperation, Message};
use crate::messaging::subscription::Subscription;
use crate::session::{RemoteCredentials, Session};

use super::context::RequestContext;
use super::destination::Destination;
use super::service::Reply;
use super::{MessageBroker, AUTHENTICATION_SERVICE_ID};

fn require_message_id(message: &Message) -> Result<&str, BrokerError> {
    message
        .message_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BrokerError::routing("message has no message id"))
}

fn no_service(destination: Option<&str>) -> BrokerError {
    BrokerError::routing(format!(
        "no service is configured to handle messages for destination '{}'",
        destination.unwrap_or("")
    ))
}

/// Turn a service result into the reply correlated to `request`.
fn into_reply(request: &Message, result: Reply) -> Message {
    let mut reply = match result {
        Reply::Message(message) => message,
        Reply::Empty => Message::acknowledge(request),
        Reply::Body(body) => {
            let mut ack = Message::acknowledge(request);
            ack.body = body;
            ack
        }
    };
    reply.correlation_id = request.message_id.clone();
    reply.client_id = request.client_id.clone();
    reply
}

impl MessageBroker {
    /// Route a data message to the service owning its destination and
    /// return the acknowledgement.
    pub fn route_message_to_service(
        &self,
        ctx: &mut RequestContext,
        mut message: Message,
    ) -> Result<Message, BrokerError> {
        let message_id = require_message_id(&message)?.to_string();
        let destination_id = message.destination.clone();

        let mut service_id = destination_id
            .as_deref()
            .and_then(|d| self.service_for_destination(d));
        if service_id.is_none() && !self.validation_listeners.is_empty() {
            if let Some(dest) = destination_id.as_deref() {
                for listener in self.validation_listeners.snapshot().iter() {
                    listener.validate_destination(self, dest);
                }
                service_id = self.service_for_destination(dest);
            }
        }

        let service = service_id
            .and_then(|id| self.service(&id))
            .ok_or_else(|| no_service(destination_id.as_deref()))?;
        let destination = destination_id
            .as_deref()
            .and_then(|d| service.destination(d))
            .ok_or_else(|| no_service(destination_id.as_deref()))?;

        self.inspect_operation(ctx, &message, &destination)?;
        message.remove_header(headers::VALIDATE_ENDPOINT);
        self.extract_remote_credentials(ctx, service.id(), &message)?;

        tracing::debug!(
            service = %service.id(),
            destination = %destination.id(),
            message_id = %message_id,
            "invoking service"
        );
        match service.service_message(self, ctx, &message) {
            Ok(result) => Ok(into_reply(&message, result)),
            Err(err) => {
                tracing::error!(
                    service = %service.id(),
                    destination = %destination.id(),
                    message_id = %message_id,
                    code = err.code(),
                    error = %err.chain(),
                    "exception when invoking service"
                );
                Err(err)
            }
        }
    }

    /// Route a command. Login and logout always go to the authentication
    /// service; ping and login replies carry the client id, the endpoint's
    /// messaging version and, on request, the service description.
    pub fn route_command_to_service(
        &self,
        ctx: &mut RequestContext,
        command: Message,
    ) -> Result<Message, BrokerError> {
        let message_id = require_message_id(&command)?.to_string();
        let operation = command.operation();
        let destination_id = command.destination.as_deref();

        let (service_id, recreate_session) = match operation {
            CommandOperation::Login | CommandOperation::Logout => {
                let recreate = operation == CommandOperation::Login
                    && self.recreate_session_after_login
                    && ctx.session.as_ref().is_some_and(|s| {
                        self.sessions
                            .provider(s.provider_kind())
                            .is_some_and(|p| p.supports_recreation())
                    });
                (Some(AUTHENTICATION_SERVICE_ID.to_string()), recreate)
            }
            _ => (destination_id.and_then(|d| self.service_for_destination(d)), false),
        };

        let mut result = None;
        let mut login_failed = false;
        if let Some(service) = service_id.as_deref().and_then(|id| self.service(id)) {
            if let Some(destination) = destination_id.and_then(|d| service.destination(d)) {
                self.inspect_operation(ctx, &command, &destination)?;
            }
            self.extract_remote_credentials(ctx, service.id(), &command)?;

            match service.service_command(self, ctx, &command) {
                Ok(reply) => result = Some(reply),
                // Failed logins still answer with client metadata.
                Err(err) if err.is_security() && service.id() == AUTHENTICATION_SERVICE_ID => {
                    tracing::debug!(message_id = %message_id, error = %err, "login rejected");
                    login_failed = true;
                    result = Some(Reply::Message(Message::error_reply(&command, &err)));
                }
                Err(err) => {
                    tracing::error!(
                        service = %service.id(),
                        operation = ?operation,
                        message_id = %message_id,
                        code = err.code(),
                        error = %err.chain(),
                        "exception when invoking service command"
                    );
                    return Err(err);
                }
            }
        }

        if recreate_session && result.is_some() && !login_failed {
            self.recreate_session(ctx)?;
        }

        let serviced = result.is_some();
        let mut reply = into_reply(&command, result.unwrap_or(Reply::Empty));

        if matches!(operation, CommandOperation::ClientPing | CommandOperation::Login) {
            if command.header_flag(headers::NEEDS_CONFIG) {
                let description = self.describe_services(ctx.endpoint_id(), true);
                if description.as_object().is_some_and(|d| !d.is_empty()) {
                    reply.body = description;
                }
            }
            if let Some(endpoint) = &ctx.endpoint {
                let version = endpoint.messaging_version();
                if version > 0 {
                    reply.set_header(headers::MESSAGING_VERSION, version);
                }
            }
            if let Some(client) = &ctx.client {
                reply.set_header(headers::FLEX_CLIENT_ID, client.id());
            }
        } else if !serviced {
            return Err(no_service(destination_id));
        }

        tracing::debug!(operation = ?operation, message_id = %message_id, "command executed");
        Ok(reply)
    }

    /// Queue `message` for the client that owns `subscription`, on the
    /// endpoint the subscription was made through.
    pub fn route_message_to_message_client(
        &self,
        message: Message,
        subscription: &Subscription,
    ) -> Result<Enqueued, BrokerError> {
        require_message_id(&message)?;
        let client = subscription
            .owner_id()
            .and_then(|id| self.clients.get(&id))
            .ok_or(BrokerError::Invalidated("client"))?;
        let endpoint_id = subscription.endpoint_id().ok_or_else(|| {
            BrokerError::routing(format!("subscription '{}' has no endpoint", subscription.key()))
        })?;
        client.push(&endpoint_id, &subscription.subscriber_id(), message)
    }

    /// Channel, security constraint and started-state checks a message must
    /// pass before its destination's service sees it.
    pub fn inspect_operation(
        &self,
        ctx: &RequestContext,
        message: &Message,
        destination: &Destination,
    ) -> Result<(), BrokerError> {
        self.inspect_channel(message, destination)?;
        self.login_manager
            .check_constraint(ctx.principal().as_ref(), destination.security_constraint())?;

        let message_id = message.message_id.clone().unwrap_or_default();
        let service_started = self
            .service(destination.service_id())
            .is_some_and(|s| s.is_started());
        if !service_started {
            return Err(BrokerError::Stopped {
                component: "Service",
                id: destination.service_id().to_string(),
                message_id,
            });
        }
        if !destination.is_started() {
            return Err(BrokerError::Stopped {
                component: "Destination",
                id: destination.id().to_string(),
                message_id,
            });
        }
        Ok(())
    }

    /// With endpoint validation enforced (globally or by the message), the
    /// message's endpoint must be one of the destination's channels.
    pub fn inspect_channel(&self, message: &Message, destination: &Destination) -> Result<(), BrokerError> {
        if !self.enforce_endpoint_validation && !message.has_header(headers::VALIDATE_ENDPOINT) {
            return Ok(());
        }
        let channels = match destination.channels() {
            [] => self.default_channels.as_slice(),
            configured => configured,
        };
        let endpoint = message.endpoint_id();
        if endpoint.is_some_and(|e| channels.iter().any(|c| c == e)) {
            return Ok(());
        }
        Err(BrokerError::routing(format!(
            "destination '{}' is not accessible over channel '{}'",
            destination.id(),
            endpoint.unwrap_or("")
        )))
    }

    /// Store, or with an empty value clear, the remote credentials a message
    /// carries for its destination.
    fn extract_remote_credentials(
        &self,
        ctx: &RequestContext,
        service_id: &str,
        message: &Message,
    ) -> Result<(), BrokerError> {
        let Some(value) = message.headers.get(headers::REMOTE_CREDENTIALS) else {
            return Ok(());
        };
        let unknown_format = || BrokerError::routing("unknown remote credentials format");
        let encoded = value.as_str().ok_or_else(unknown_format)?;
        let destination_id = message.destination.as_deref().unwrap_or("");
        let Some(session) = &ctx.session else {
            tracing::debug!(service = %service_id, "remote credentials without a session ignored");
            return Ok(());
        };

        if encoded.is_empty() {
            session.clear_remote_credentials(service_id, destination_id);
            return Ok(());
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| unknown_format())?;
        let charset = message.header_str(headers::REMOTE_CREDENTIALS_CHARSET);
        let decoded = match charset.map(|c| c.to_ascii_lowercase()) {
            None => String::from_utf8(bytes).map_err(|_| unknown_format())?,
            Some(c) if c == "utf-8" || c == "utf8" => String::from_utf8(bytes).map_err(|_| unknown_format())?,
            Some(c) if c == "iso-8859-1" || c == "latin1" || c == "us-ascii" => {
                bytes.into_iter().map(char::from).collect()
            }
            Some(_) => return Err(unknown_format()),
        };
        let (username, password) = decoded
            .split_once(':')
            .filter(|(user, pass)| !user.is_empty() && !pass.is_empty())
            .ok_or_else(unknown_format)?;

        session.put_remote_credentials(
            service_id,
            destination_id,
            RemoteCredentials {
                username: username.to_string(),
                password: password.to_string(),
                charset: charset.map(str::to_string),
            },
        );
        Ok(())
    }

    /// Swap the request's session for a fresh one carrying the principal and
    /// client associations, then invalidate the old one.
    fn recreate_session(&self, ctx: &mut RequestContext) -> Result<(), BrokerError> {
        let Some(old) = ctx.session.clone() else {
            return Ok(());
        };
        let clients: Vec<Arc<ClientIdentity>> = old
            .client_ids()
            .iter()
            .filter_map(|id| self.clients.get(id))
            .collect();
        let fresh = self.replacement_session(&old, &clients)?;
        old.invalidate();
        tracing::info!(old_session = %old.id(), session_id = %fresh.id(), "session recreated after login");
        ctx.session = Some(fresh);
        Ok(())
    }

    /// A new session of `old`'s kind holding its principal and bound to
    /// `clients`. On failure the new session is invalidated before returning.
    pub(crate) fn replacement_session(
        &self,
        old: &Session,
        clients: &[Arc<ClientIdentity>],
    ) -> Result<Arc<Session>, BrokerError> {
        let fresh = self.sessions.create_session(old.provider_kind())?;
        let carried = fresh
            .set_principal(old.principal())
            .and_then(|_| clients.iter().try_for_each(|client| client.register_session(&fresh)));
        if let Err(err) = carried {
            tracing::warn!(session_id = %fresh.id(), error = %err, "replacement session discarded");
            fresh.invalidate();
            return Err(err);
        }
        Ok(fresh)
    }
}
