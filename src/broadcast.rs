//! Internal broadcast API.
//!
//! A loopback HTTP surface for co-located services, protected by a static
//! shared secret in the `x-internal-auth` header. Permission changes are
//! written through the store first, then pushed into the live hub (if
//! any) so connected peers receive the update without reconnecting.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::crdt::{BroadcastKind, PermissionBroadcast};
use crate::error::CLOSE_NORMAL;
use crate::hub::DocumentId;
use crate::permissions::PermissionLevel;
use crate::server::SharedState;

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/broadcast/permission-change", post(permission_change))
        .route("/broadcast/document-deletion", post(document_deletion))
        .route("/broadcast/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionChangeRequest {
    #[serde(default)]
    owner: String,
    #[serde(default)]
    permlink: String,
    #[serde(default)]
    target_account: String,
    #[serde(default)]
    permission_type: String,
    #[serde(default)]
    granted_by: String,
}

#[derive(Debug, Deserialize)]
struct DocumentDeletionRequest {
    #[serde(default)]
    owner: String,
    #[serde(default)]
    permlink: String,
}

#[derive(Debug, Serialize)]
struct BroadcastResponse {
    success: bool,
    broadcast: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl BroadcastResponse {
    fn ok(broadcast: bool) -> Json<Self> {
        Json(Self { success: true, broadcast, error: None })
    }

    fn err(message: &str) -> Json<Self> {
        Json(Self { success: false, broadcast: false, error: Some(message.to_string()) })
    }
}

/// Compare the presented secret without short-circuiting on the first
/// differing byte.
fn secrets_match(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

fn authorized(state: &SharedState, headers: &HeaderMap) -> bool {
    let Some(secret) = state.config.internal_secret.as_deref() else {
        return false;
    };
    headers
        .get("x-internal-auth")
        .and_then(|value| value.to_str().ok())
        .map(|presented| secrets_match(presented, secret))
        .unwrap_or(false)
}

async fn permission_change(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(req): Json<PermissionChangeRequest>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, BroadcastResponse::err("unauthorized"));
    }
    if req.owner.is_empty()
        || req.permlink.is_empty()
        || req.target_account.is_empty()
        || req.permission_type.is_empty()
        || req.granted_by.is_empty()
    {
        return (StatusCode::BAD_REQUEST, BroadcastResponse::err("missing fields"));
    }
    let Some(level) = PermissionLevel::parse(&req.permission_type) else {
        return (
            StatusCode::BAD_REQUEST,
            BroadcastResponse::err("unknown permission type"),
        );
    };

    // Write-through first: the store must always be at least as fresh as
    // any live hub.
    let upserted = {
        let store = state.store.clone();
        let req_owner = req.owner.clone();
        let req_permlink = req.permlink.clone();
        let account = req.target_account.clone();
        let granted_by = req.granted_by.clone();
        tokio::task::spawn_blocking(move || {
            store.upsert_permission(&req_owner, &req_permlink, &account, level, &granted_by)
        })
        .await
    };
    if !matches!(upserted, Ok(Ok(()))) {
        tracing::error!(owner = %req.owner, permlink = %req.permlink, "permission upsert failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            BroadcastResponse::err("store write failed"),
        );
    }

    let id = DocumentId { owner: req.owner.clone(), permlink: req.permlink.clone() };
    let broadcast = match state.registry.get(&id) {
        // No active clients; the next connect reads fresh permissions.
        None => false,
        Some(hub) => {
            let timestamp_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            hub.ingest_permission_update(PermissionBroadcast {
                target_account: req.target_account.clone(),
                new_level: level,
                granted_by: req.granted_by.clone(),
                timestamp_ms,
                event_kind: if level == PermissionLevel::None {
                    BroadcastKind::Revoked
                } else {
                    BroadcastKind::Granted
                },
            })
            .await
        }
    };

    tracing::info!(
        owner = %req.owner,
        permlink = %req.permlink,
        account = %req.target_account,
        level = level.as_str(),
        broadcast,
        "permission change accepted"
    );
    (StatusCode::OK, BroadcastResponse::ok(broadcast))
}

async fn document_deletion(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(req): Json<DocumentDeletionRequest>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, BroadcastResponse::err("unauthorized"));
    }
    if req.owner.is_empty() || req.permlink.is_empty() {
        return (StatusCode::BAD_REQUEST, BroadcastResponse::err("missing fields"));
    }

    let id = DocumentId { owner: req.owner.clone(), permlink: req.permlink.clone() };
    let broadcast = match state.registry.get(&id) {
        None => false,
        // Discard unsaved state: the document no longer exists.
        Some(hub) => hub.close_all(CLOSE_NORMAL, "document deleted", true),
    };
    tracing::info!(owner = %req.owner, permlink = %req.permlink, broadcast, "document deletion");
    (StatusCode::OK, BroadcastResponse::ok(broadcast))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    active_connections: i64,
    active_documents: usize,
    uptime_seconds: u64,
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_connections: state
            .active_connections
            .load(std::sync::atomic::Ordering::Relaxed),
        active_documents: state.registry.len(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}
