//! HTTP and WebSocket surfaces over the broker. Both decode messages, bind
//! the request to a session and client identity, and hand each message to
//! the router.

pub mod http;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;

use crate::broker::context::RequestContext;
use crate::broker::endpoint::Endpoint;
use crate::error::BrokerError;
use crate::message::{headers, CommandOperation, Message};
use crate::AppState;

/// Request/response header carrying the polling session id.
pub const SESSION_HEADER: &str = "x-session-id";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .merge(http::router())
        .merge(stream::router())
}

async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> Json<Value> {
    let broker = &state.broker;
    Json(serde_json::json!({
        "status": if broker.is_started() { "ok" } else { "stopped" },
        "sessions": broker.sessions().len(),
        "clients": broker.clients().len(),
    }))
}

/// Look up an endpoint that can take traffic here.
pub(crate) fn local_endpoint(state: &AppState, endpoint_id: &str) -> Result<Arc<dyn Endpoint>, BrokerError> {
    let endpoint = state
        .broker
        .endpoint(endpoint_id)
        .ok_or_else(|| BrokerError::routing(format!("unknown endpoint '{endpoint_id}'")))?;
    if endpoint.is_remote() || !endpoint.is_started() {
        return Err(BrokerError::routing(format!(
            "endpoint '{endpoint_id}' is not accepting messages"
        )));
    }
    Ok(endpoint)
}

/// Attach the client identity named by `DSId` (or a fresh one) to `ctx`.
fn bind_client(state: &AppState, ctx: &mut RequestContext, message: &Message) -> Result<(), BrokerError> {
    let requested = message
        .header_str(headers::FLEX_CLIENT_ID)
        .filter(|id| !id.is_empty() && *id != "nil");
    if let Some(client) = &ctx.client {
        if requested.map_or(true, |id| id == client.id()) && client.is_valid() {
            return Ok(());
        }
    }
    let client = state.broker.clients().get_or_create(requested)?;
    if let Some(session) = &ctx.session {
        client.register_session(session)?;
    }
    ctx.client = Some(client);
    Ok(())
}

/// Route one inbound message and produce its reply. Failures become error
/// replies correlated to the request.
pub(crate) async fn dispatch(state: &AppState, ctx: &mut RequestContext, mut message: Message) -> Message {
    if let Some(endpoint_id) = ctx.endpoint_id() {
        if !message.has_header(headers::ENDPOINT) {
            message.set_header(headers::ENDPOINT, endpoint_id);
        }
    }
    let request = message.clone();
    match handle(state, ctx, message).await {
        Ok(reply) => reply,
        Err(err) => {
            tracing::debug!(
                message_id = ?request.message_id,
                code = err.code(),
                error = %err,
                "request failed"
            );
            Message::error_reply(&request, &err)
        }
    }
}

async fn handle(state: &AppState, ctx: &mut RequestContext, message: Message) -> Result<Message, BrokerError> {
    bind_client(state, ctx, &message)?;
    if !message.is_command() {
        return state.broker.route_message_to_service(ctx, message);
    }
    match message.operation() {
        CommandOperation::Poll if message.destination.is_none() => poll(state, ctx, &message).await,
        CommandOperation::Disconnect => {
            if let Some(session) = &ctx.session {
                tracing::info!(session_id = %session.id(), "client disconnected");
                session.invalidate();
            }
            Ok(Message::acknowledge(&message))
        }
        _ => state.broker.route_command_to_service(ctx, message),
    }
}

/// Endpoint-level poll: drain the client's queue for this endpoint, parking
/// for up to `DSPollWait` milliseconds when it is empty.
async fn poll(state: &AppState, ctx: &RequestContext, request: &Message) -> Result<Message, BrokerError> {
    let (Some(client), Some(endpoint_id)) = (&ctx.client, ctx.endpoint_id()) else {
        return Err(BrokerError::routing("poll requires a client and an endpoint"));
    };
    let wait = match request.header(headers::POLL_WAIT).and_then(Value::as_u64) {
        Some(ms) => Duration::from_millis(ms).min(state.config.max_poll_wait),
        None => Duration::ZERO,
    };
    let messages = if wait.is_zero() {
        client.poll(endpoint_id)?
    } else {
        client.poll_wait(endpoint_id, wait, ctx.session.as_deref()).await?
    };
    if messages.is_empty() {
        return Ok(Message::acknowledge(request));
    }
    let mut sync = Message::command(CommandOperation::ClientSync);
    sync.correlation_id = request.message_id.clone();
    sync.client_id = Some(client.id().to_string());
    sync.body = serde_json::to_value(messages)?;
    Ok(sync)
}

/// Frames may carry one message or an array of them.
pub(crate) fn decode_batch(value: Value) -> Result<Vec<Message>, BrokerError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(BrokerError::from))
            .collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_accepts_single_and_array() {
        let one = serde_json::to_value(Message::command(CommandOperation::ClientPing)).unwrap();
        assert_eq!(decode_batch(one.clone()).unwrap().len(), 1);
        assert_eq!(decode_batch(json!([one.clone(), one])).unwrap().len(), 2);
        assert!(decode_batch(json!(42)).is_err());
    }
}
