//! WebSocket streaming endpoint. The socket is the session: pushes are
//! flushed as soon as they are queued and the session is marked
//! disconnected when the socket goes away.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as Frame, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use crate::broker::context::RequestContext;
use crate::client::ClientIdentity;
use crate::error::BrokerError;
use crate::message::Message;
use crate::session::provider::STREAMING;
use crate::session::Session;
use crate::AppState;

use super::{decode_batch, dispatch, local_endpoint};

/// Close codes (4000-range for application-level).
const CLOSE_INVALID_FRAME: u16 = 4000;
const CLOSE_SESSION_INVALIDATED: u16 = 4009;

/// Upper bound on a single park between flushes.
const FLUSH_WAIT: Duration = Duration::from_secs(30);

type FrameSink = SplitSink<WebSocket, Frame>;

pub fn router() -> Router<AppState> {
    Router::new().route("/messagebroker/{endpoint_id}/stream", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(endpoint_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, BrokerError> {
    let endpoint = local_endpoint(&state, &endpoint_id)?;
    let session = state.broker.sessions().create_session(STREAMING)?;
    let ctx = RequestContext::new(Some(session), None, Some(endpoint));
    Ok(ws
        .on_upgrade(move |socket| handle_connection(socket, state, ctx))
        .into_response())
}

async fn handle_connection(socket: WebSocket, state: AppState, mut ctx: RequestContext) {
    let Some(session) = ctx.session.clone() else {
        return;
    };
    let (mut ws_tx, ws_rx) = socket.split();
    session.set_connected(true);
    tracing::info!(session_id = %session.id(), endpoint = ?ctx.endpoint_id(), "stream opened");

    run_stream(&state, &mut ctx, &session, &mut ws_tx, ws_rx).await;

    session.set_connected(false);
    let _ = ws_tx.close().await;
    tracing::info!(session_id = %session.id(), "stream closed");
}

async fn run_stream(
    state: &AppState,
    ctx: &mut RequestContext,
    session: &Arc<Session>,
    ws_tx: &mut FrameSink,
    mut ws_rx: SplitStream<WebSocket>,
) {
    let closed = session.closed();
    loop {
        let client = ctx.client.clone();
        let endpoint_id = ctx.endpoint_id().unwrap_or_default().to_string();

        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Frame::Text(text))) => {
                        let batch = serde_json::from_str(text.as_str())
                            .map_err(BrokerError::from)
                            .and_then(decode_batch);
                        let messages = match batch {
                            Ok(messages) => messages,
                            Err(err) => {
                                tracing::debug!(session_id = %session.id(), error = %err, "invalid stream frame");
                                let _ = send_close(ws_tx, CLOSE_INVALID_FRAME, "Invalid message").await;
                                break;
                            }
                        };
                        let mut replies = Vec::with_capacity(messages.len());
                        for message in messages {
                            replies.push(dispatch(state, ctx, message).await);
                        }
                        if send_messages(ws_tx, &replies).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Frame::Ping(_))) | Some(Ok(Frame::Pong(_))) => continue,
                    Some(Ok(Frame::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, session_id = %session.id(), "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            pushed = flush(client.as_deref(), &endpoint_id, session) => {
                match pushed {
                    Ok(messages) if messages.is_empty() => continue,
                    Ok(messages) => {
                        if send_messages(ws_tx, &messages).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(session_id = %session.id(), error = %err, "stream flush stopped");
                        ctx.client = None;
                    }
                }
            }

            _ = closed.cancelled() => {
                let _ = send_close(ws_tx, CLOSE_SESSION_INVALIDATED, "Session invalidated").await;
                break;
            }
        }
    }
}

/// Wait for messages queued for the bound client. Never resolves until a
/// client is bound.
async fn flush(
    client: Option<&ClientIdentity>,
    endpoint_id: &str,
    session: &Session,
) -> Result<Vec<Message>, BrokerError> {
    match client {
        Some(client) => client.poll_wait(endpoint_id, FLUSH_WAIT, Some(session)).await,
        None => std::future::pending().await,
    }
}

async fn send_messages(ws_tx: &mut FrameSink, messages: &[Message]) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(messages) {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(?err, "failed to encode outbound frame");
            return Ok(());
        }
    };
    ws_tx.send(Frame::Text(json.into())).await
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut FrameSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Frame::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
