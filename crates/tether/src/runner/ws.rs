//! WebSocket handler for runner connections.
//!
//! The runner dials `GET /api/runner/ws/:session_id?token=<callback>` from
//! inside its sandbox. The socket is split into a write pump fed by the
//! session actor and a read loop that decodes frames and posts them back to
//! the actor, which applies natural backpressure through its mailbox.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_protocol::{decode_runner_frame, ControlFrame};

use crate::api::{ApiError, AppState};
use crate::session::ActorHandle;

/// Outbound control-frame buffer toward one runner socket.
const RUNNER_SEND_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
pub struct RunnerQuery {
    token: String,
}

/// Upgrade handler for the per-session runner socket.
pub async fn runner_ws_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<RunnerQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let status = state
        .sessions
        .registry()
        .handle(&session_id)
        .status()
        .await
        .map_err(ApiError::from)?;

    if status.is_terminal() {
        return Err(ApiError::conflict("session already terminated"));
    }

    verify_callback_token(&state, &session_id, &query.token).await?;

    let handle = state.sessions.registry().handle(&session_id);
    info!(session_id, "runner connecting");
    Ok(ws.on_upgrade(move |socket| serve_runner(socket, handle)))
}

async fn verify_callback_token(
    state: &AppState,
    session_id: &str,
    presented: &str,
) -> Result<(), ApiError> {
    let session = state
        .session_repo
        .get(session_id)
        .await
        .map_err(|err| ApiError::from(crate::error::CoreError::Internal(err)))?
        .ok_or_else(|| ApiError::not_found(format!("session {session_id}")))?;

    let expected = session
        .metadata_value()
        .get("callback_token")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    match expected {
        Some(expected) if expected == presented => Ok(()),
        _ => Err(ApiError::unauthorized("invalid runner callback token")),
    }
}

async fn serve_runner(socket: WebSocket, handle: ActorHandle) {
    let session_id = handle.session_id().to_string();
    let (mut sink, mut source) = socket.split();

    let (control_tx, mut control_rx) = mpsc::channel::<ControlFrame>(RUNNER_SEND_BUFFER);
    if let Err(err) = handle.attach_runner(control_tx).await {
        warn!(session_id, error = %err, "runner attach rejected");
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    // Write pump: actor -> runner.
    let write_session = session_id.clone();
    let write_task = tokio::spawn(async move {
        while let Some(frame) = control_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(err) => {
                    warn!(session_id = %write_session, error = %err, "unserializable control frame");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Read loop: runner -> actor.
    while let Some(result) = source.next().await {
        match result {
            Ok(Message::Text(text)) => match decode_runner_frame(text.as_str()) {
                Ok(Some(frame)) => {
                    if handle.post_frame(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    warn!(session_id, "ignoring unknown runner frame type");
                }
                Err(err) => {
                    warn!(session_id, error = %err, "malformed runner frame");
                }
            },
            Ok(Message::Binary(_)) => {
                debug!(session_id, "ignoring binary runner message");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(session_id, "runner closed its socket");
                break;
            }
            Err(err) => {
                warn!(session_id, error = %err, "runner socket error");
                break;
            }
        }
    }

    handle.runner_closed();
    write_task.abort();
    info!(session_id, "runner link torn down");
}
