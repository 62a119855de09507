//! Request/response polling endpoint.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use crate::broker::context::RequestContext;
use crate::broker::endpoint::Endpoint;
use crate::error::BrokerError;
use crate::session::Session;
use crate::AppState;

use super::{decode_batch, dispatch, local_endpoint, SESSION_HEADER};

pub fn router() -> Router<AppState> {
    Router::new().route("/messagebroker/{endpoint_id}", post(handle_batch))
}

/// Reuse the session named by the request header, or start a new one of
/// the kind the endpoint serves.
fn resolve_session(
    state: &AppState,
    endpoint: &dyn Endpoint,
    headers: &HeaderMap,
) -> Result<Arc<Session>, BrokerError> {
    let existing = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|id| state.broker.sessions().get(id))
        .filter(|s| s.is_valid() && s.provider_kind() == endpoint.session_kind());
    if let Some(session) = existing {
        session.touch();
        return Ok(session);
    }
    let session = state.broker.sessions().create_session(endpoint.session_kind())?;
    tracing::debug!(session_id = %session.id(), endpoint = %endpoint.id(), "session created for request");
    Ok(session)
}

async fn handle_batch(
    State(state): State<AppState>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, BrokerError> {
    let endpoint = local_endpoint(&state, &endpoint_id)?;
    let messages = decode_batch(body)?;
    let session = resolve_session(&state, endpoint.as_ref(), &headers)?;

    let mut ctx = RequestContext::new(Some(session), None, Some(endpoint));
    let mut replies = Vec::with_capacity(messages.len());
    for message in messages {
        replies.push(dispatch(&state, &mut ctx, message).await);
    }

    // Login may have swapped the session; report the one that is current.
    let session_id = ctx
        .session
        .as_ref()
        .map(|s| s.id().to_string())
        .unwrap_or_default();
    let mut response = Json(replies).into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}
