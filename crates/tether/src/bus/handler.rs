//! WebSocket endpoint for event bus subscribers.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AppState};

use super::hub::EventBus;
use super::types::SubscriptionFilters;

/// Keepalive interval for subscriber connections.
const PING_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated subject ids to restrict to.
    subjects: Option<String>,
    /// Comma-separated kind prefixes (e.g. `session.,workflow.`).
    kinds: Option<String>,
}

/// WebSocket upgrade for `GET /api/events/ws`.
///
/// Identity comes from the `x-tether-user` header or, for browser clients
/// that cannot set headers on WS upgrades, the `bearer.<token>` subprotocol.
pub async fn events_ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user_id = resolve_user(&state, &headers)
        .ok_or_else(|| ApiError::unauthorized("missing caller identity"))?;

    let filters = SubscriptionFilters {
        subjects: split_csv(query.subjects.as_deref()),
        kind_prefixes: split_csv(query.kinds.as_deref()),
    };

    info!(user_id, "event bus subscriber connecting");
    let bus = state.bus.clone();
    Ok(ws.on_upgrade(move |socket| pump_events(socket, bus, user_id, filters)))
}

fn resolve_user(state: &AppState, headers: &HeaderMap) -> Option<String> {
    if let Some(user) = headers
        .get("x-tether-user")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Some(user.to_string());
    }

    // `Sec-WebSocket-Protocol: bearer.<token>` — the token is resolved by the
    // out-of-scope auth layer; in dev mode it is the user id itself.
    if let Some(proto) = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    {
        for candidate in proto.split(',') {
            if let Some(token) = candidate.trim().strip_prefix("bearer.") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    state.settings.default_user.clone()
}

fn split_csv(raw: Option<&str>) -> Option<Vec<String>> {
    let raw = raw?;
    let parts: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if parts.is_empty() { None } else { Some(parts) }
}

async fn pump_events(
    socket: WebSocket,
    bus: Arc<EventBus>,
    user_id: String,
    filters: SubscriptionFilters,
) {
    let (mut sender, mut receiver) = socket.split();
    let (mut event_rx, conn_id) = bus.register(&user_id, filters);

    let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping_interval.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            maybe_event = event_rx.recv() => {
                let Some(event) = maybe_event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(user_id, error = %err, "failed to serialize bus event");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            maybe_msg = receiver.next() => {
                match maybe_msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(other)) => {
                        debug!(user_id, "ignoring inbound bus message: {other:?}");
                    }
                    Some(Err(err)) => {
                        warn!(user_id, error = %err, "event bus socket error");
                        break;
                    }
                }
            }
        }
    }

    bus.unregister(&user_id, conn_id);
    info!(user_id, conn_id, "event bus subscriber disconnected");
}
