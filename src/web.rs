//! Client-facing WebSocket gateway.
//!
//! `GET /<owner>/<permlink>` upgrades to a WebSocket. The authentication
//! token `{account, challenge, pubkey, signature}` arrives either as the
//! `token` query parameter or as the first message after the upgrade,
//! within the handshake deadline. After a successful handshake the
//! connection is attached to the document's hub and the read loop begins:
//! every inbound frame is posted to the hub, every hub frame is written
//! back out, and idle connections are probed with pings.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tower_http::cors::CorsLayer;

use crate::auth::{self, AuthToken, ChallengeWindow};
use crate::error::{AuthError, CLOSE_INTERNAL, CLOSE_NORMAL, CLOSE_POLICY};
use crate::hub::{Connection, DocumentId, HubHandle, SessionContext};
use crate::permissions::user_color;
use crate::server::SharedState;

static CONN_IDS: AtomicU64 = AtomicU64::new(1);

/// Protocol violations tolerated per 10 second window before the
/// connection is closed.
const MAX_VIOLATIONS: usize = 5;
const VIOLATION_WINDOW: Duration = Duration::from_secs(10);

pub fn router(state: Arc<SharedState>) -> Router {
    let cors = if state.config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };
    Router::new()
        .route("/{owner}/{permlink}", get(ws_upgrade))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path((owner, permlink)): Path<(String, String)>,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, owner, permlink, query.token))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<SharedState>,
    owner: String,
    permlink: String,
    query_token: Option<String>,
) {
    let Some(document) = DocumentId::parse(&format!("{owner}/{permlink}")) else {
        close_with(&mut socket, CLOSE_POLICY, "MissingFields").await;
        return;
    };

    // ── Handshake ──────────────────────────────────────────────────
    let handshake = Duration::from_secs(state.config.handshake_timeout_secs);
    let raw_token = match query_token {
        Some(token) => token,
        None => match tokio::time::timeout(handshake, socket.recv()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => text.to_string(),
            Ok(Some(Ok(WsMessage::Binary(data)))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    close_with(&mut socket, CLOSE_POLICY, "MissingFields").await;
                    return;
                }
            },
            _ => {
                close_with(&mut socket, CLOSE_POLICY, "MissingFields").await;
                return;
            }
        },
    };

    let token = match AuthToken::parse(&raw_token) {
        Ok(token) => token,
        Err(e) => {
            tracing::info!(document = %document, reason = e.kind(), "auth rejected");
            close_with(&mut socket, CLOSE_POLICY, e.kind()).await;
            return;
        }
    };

    let window = ChallengeWindow {
        max_age: Duration::from_secs(state.config.challenge_max_age_secs),
        max_future_skew: Duration::from_secs(state.config.challenge_max_skew_secs),
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if let Err(e) =
        auth::authenticate(&state.keys, &token, now, window, &state.config.key_prefix).await
    {
        tracing::info!(
            document = %document,
            account = %token.account,
            reason = e.kind(),
            "auth rejected"
        );
        close_with(&mut socket, CLOSE_POLICY, e.kind()).await;
        return;
    }

    // ── Authorization ──────────────────────────────────────────────
    let permission = {
        let store = state.store.clone();
        let (account, o, p) = (token.account.clone(), document.owner.clone(), document.permlink.clone());
        match tokio::task::spawn_blocking(move || store.resolve_permission(&account, &o, &p)).await
        {
            Ok(Ok(permission)) => permission,
            _ => {
                close_with(&mut socket, CLOSE_POLICY, AuthError::Upstream("store".into()).kind())
                    .await;
                return;
            }
        }
    };
    if !permission.can_read {
        tracing::info!(document = %document, account = %token.account, "access denied");
        close_with(&mut socket, CLOSE_POLICY, AuthError::AccessDenied.kind()).await;
        return;
    }

    // ── Attach ─────────────────────────────────────────────────────
    let hub = match state
        .registry
        .get_or_create(&document, &state.store, &state.config)
        .await
    {
        Ok(hub) => hub,
        Err(e) => {
            tracing::error!(document = %document, error = %e, "hub cold-start failed");
            close_with(&mut socket, CLOSE_POLICY, "Upstream").await;
            return;
        }
    };

    let ctx = SessionContext {
        account: token.account.clone(),
        document: document.clone(),
        permission,
        color: user_color(&token.account, permission.level),
        connected_at: chrono::Utc::now(),
    };
    let conn_id = CONN_IDS.fetch_add(1, Ordering::Relaxed);
    let (frames_tx, frames_rx) = mpsc::channel(state.config.outbound_queue_frames);
    let (close_tx, close_rx) = oneshot::channel();
    if hub
        .attach(Connection { id: conn_id, ctx, frames: frames_tx, close: close_tx })
        .await
        .is_err()
    {
        close_with(&mut socket, CLOSE_INTERNAL, "server error").await;
        return;
    }

    state
        .active_connections
        .fetch_add(1, Ordering::Relaxed);
    state.log_activity(&document, &token.account, "connect");
    tracing::info!(document = %document, account = %token.account, conn_id, "connected");

    read_loop(&mut socket, &state, &hub, conn_id, frames_rx, close_rx).await;

    hub.detach(conn_id);
    state
        .active_connections
        .fetch_sub(1, Ordering::Relaxed);
    state.log_activity(&document, &token.account, "disconnect");
    tracing::info!(document = %document, account = %token.account, conn_id, "disconnected");
}

async fn read_loop(
    socket: &mut WebSocket,
    state: &Arc<SharedState>,
    hub: &HubHandle,
    conn_id: u64,
    mut frames_rx: mpsc::Receiver<Vec<u8>>,
    mut close_rx: oneshot::Receiver<(u16, String)>,
) {
    let idle = Duration::from_secs(state.config.idle_timeout_secs);
    let mut last_activity = Instant::now();
    let mut pinged = false;
    let mut violations: VecDeque<Instant> = VecDeque::new();

    loop {
        // One idle window buys a ping probe; a second one ends the session.
        let idle_deadline = last_activity + if pinged { idle * 2 } else { idle };
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(WsMessage::Binary(data))) => {
                    last_activity = Instant::now();
                    pinged = false;
                    hub.frame(conn_id, data.to_vec());
                }
                Some(Ok(WsMessage::Text(_))) => {
                    // Binary-only after the handshake.
                    last_activity = Instant::now();
                    if record_violation(&mut violations) {
                        close_with(socket, CLOSE_INTERNAL, "protocol violation").await;
                        break;
                    }
                }
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                    last_activity = Instant::now();
                    pinged = false;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(_)) => break,
            },
            frame = frames_rx.recv() => match frame {
                Some(frame) => {
                    if socket.send(WsMessage::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                // Hub dropped us without a close reason: hub is gone.
                None => {
                    close_with(socket, CLOSE_INTERNAL, "server error").await;
                    break;
                }
            },
            reason = &mut close_rx => {
                if let Ok((code, reason)) = reason {
                    close_with(socket, code, &reason).await;
                }
                break;
            },
            _ = tokio::time::sleep_until(idle_deadline) => {
                if pinged {
                    close_with(socket, CLOSE_NORMAL, "idle timeout").await;
                    break;
                }
                if socket.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                pinged = true;
            }
        }
    }
}

/// Record one violation; true once the window is exhausted.
fn record_violation(violations: &mut VecDeque<Instant>) -> bool {
    let now = Instant::now();
    violations.push_back(now);
    while violations
        .front()
        .is_some_and(|t| now.duration_since(*t) > VIOLATION_WINDOW)
    {
        violations.pop_front();
    }
    violations.len() >= MAX_VIOLATIONS
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
