//! Socket endpoint: origin check, registration, snapshot, then relay.
//!
//! The connection registers before the snapshot is read, so no publish can
//! fall between the two. The cost is the opposite edge: an envelope built
//! from store state older than the snapshot, but relayed during the read,
//! reaches the client after the snapshot. Clients that keep only the latest
//! envelope may briefly show that older state; the next publish replaces it.

use axum::{
    extract::{
        Extension,
        ws::{
            CloseFrame, Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection,
        },
    },
    http::{HeaderMap, StatusCode, header::ORIGIN},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use tracing::{debug, info, warn};

use hireloop_events::QueueEnvelope;

use crate::app::AppState;
use crate::app::errors::json_error;
use crate::bridge::{
    CLOSE_GOING_AWAY, CLOSE_INTERNAL, CLOSE_POLICY, CLOSE_TRY_AGAIN_LATER, Outbound,
    PolicyViolation,
};

/// GET / and GET /ws
///
/// 101 on a valid upgrade, 426 for anything that did not ask for one.
pub async fn upgrade(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(error = %rejection, "plain request on socket endpoint");
            return json_error(
                StatusCode::UPGRADE_REQUIRED,
                "upgrade_required",
                "this endpoint only accepts WebSocket upgrades",
            );
        }
    };

    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let verdict = state.origins.check(origin.as_deref());

    ws.on_upgrade(move |socket| async move {
        match verdict {
            Ok(()) => serve(socket, state).await,
            Err(violation) => reject(socket, violation).await,
        }
    })
}

fn close(code: u16, reason: impl Into<Cow<'static, str>>) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

async fn reject(mut socket: WebSocket, violation: PolicyViolation) {
    warn!(error = %violation, "socket rejected by origin policy");
    let _ = socket.send(close(CLOSE_POLICY, "origin not allowed")).await;
}

async fn serve(socket: WebSocket, state: AppState) {
    let registry = state.services.registry.clone();

    // Register before reading the snapshot: anything published after the read
    // is already queued for this connection.
    let (id, mut outbound) = match registry.register() {
        Ok(registered) => registered,
        Err(e) => {
            let mut socket = socket;
            debug!(error = %e, "refusing socket");
            let _ = socket.send(close(CLOSE_GOING_AWAY, "server shutting down")).await;
            return;
        }
    };
    let (mut tx, mut rx) = socket.split();
    info!(connection_id = id, active = registry.len(), "socket connected");

    let snapshot = match state.services.store.snapshot().await {
        Ok(jobs) => QueueEnvelope::queue(jobs).to_json().map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match snapshot {
        Ok(text) => {
            if tx.send(Message::Text(text)).await.is_err() {
                registry.unregister(id);
                return;
            }
        }
        Err(e) => {
            warn!(connection_id = id, error = %e, "snapshot unavailable; closing socket");
            registry.unregister(id);
            let _ = tx.send(close(CLOSE_INTERNAL, "snapshot unavailable")).await;
            return;
        }
    }

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Text(payload)) => {
                    if let Err(e) = tx.send(Message::Text(payload.to_string())).await {
                        debug!(connection_id = id, error = %e, "socket send failed");
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = tx.send(close(code, reason)).await;
                    break;
                }
                None => {
                    debug!(connection_id = id, "dropped by registry");
                    let _ = tx.send(close(CLOSE_TRY_AGAIN_LATER, "connection too slow")).await;
                    break;
                }
            },
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(connection_id = id, error = %e, "socket error");
                    break;
                }
                // Clients have nothing to say; pings are answered by the transport.
                Some(Ok(_)) => {}
            },
        }
    }

    registry.unregister(id);
    info!(connection_id = id, active = registry.len(), "socket disconnected");
}
