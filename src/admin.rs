//! Basic-auth admin surface: key management, recent traffic, live updates.
//!
//! JSON only; the plaintext of a created key appears exactly once in the
//! creation response. `GET /admin/ws` streams hub events to dashboards.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::events::Subscription;
use crate::keys::{self, mask_key};
use crate::AppState;

const DEFAULT_RATE_LIMIT_PER_SEC: i32 = 10;
const WS_PING_INTERVAL: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/keys", get(handle_list_keys).post(handle_create_key))
        .route("/admin/keys/{id}/disable", post(handle_disable_key))
        .route("/admin/recent", get(handle_recent))
        .route("/admin/stats", get(handle_stats))
        .route("/admin/ws", get(handle_ws))
        .layer(middleware::from_fn_with_state(state, require_basic_auth))
}

// ---------------------------------------------------------------------------
// Basic auth
// ---------------------------------------------------------------------------

async fn require_basic_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if !authorized(&state.config, request.headers()) {
        return (
            StatusCode::UNAUTHORIZED,
            [(WWW_AUTHENTICATE, "Basic realm=\"gh-proxy\"")],
            "Unauthorized",
        )
            .into_response();
    }
    next.run(request).await
}

fn authorized(config: &Config, headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };
    let user_ok = user.as_bytes().ct_eq(config.admin_user.as_bytes());
    let pass_ok = pass.as_bytes().ct_eq(config.admin_pass.as_bytes());
    bool::from(user_ok & pass_ok)
}

// ---------------------------------------------------------------------------
// Key management
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct KeySummary {
    id: Uuid,
    display: String,
    rate_limit_per_sec: i32,
    total: i64,
    hit_rate: f64,
    last_used: Option<DateTime<Utc>>,
    disabled: bool,
}

/// `GET /admin/keys`
async fn handle_list_keys(State(state): State<Arc<AppState>>) -> Result<Response, AdminError> {
    let keys = keys::list_keys(&state.db).await?;
    let summaries: Vec<KeySummary> = keys
        .iter()
        .map(|key| KeySummary {
            id: key.id,
            display: key.display(),
            rate_limit_per_sec: key.rate_limit_per_sec,
            total: key.total_requests,
            hit_rate: key.hit_rate(),
            last_used: key.last_used_at,
            disabled: key.disabled,
        })
        .collect();
    Ok(Json(summaries).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    owner: String,
    app_name: String,
    machine: String,
    rate_limit_per_sec: Option<i32>,
}

#[derive(Debug, Serialize)]
struct CreatedKey {
    id: Uuid,
    /// Shown once; only the hash is stored.
    key: String,
    display: String,
}

/// `POST /admin/keys`
async fn handle_create_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<Response, AdminError> {
    let owner = request.owner.trim();
    let app_name = request.app_name.trim();
    let machine = request.machine.trim();
    if owner.is_empty() || app_name.is_empty() || machine.is_empty() {
        return Err(AdminError::BadRequest("missing fields".into()));
    }
    let per_sec = match request.rate_limit_per_sec {
        Some(value) if value > 0 => value,
        Some(_) => return Err(AdminError::BadRequest("rate limit must be positive".into())),
        None => DEFAULT_RATE_LIMIT_PER_SEC,
    };

    let generated = keys::generate_key(owner, app_name, machine);
    let id = keys::insert_key(&state.db, &generated, owner, app_name, machine, per_sec).await?;
    info!(
        owner,
        app_name,
        machine,
        key = %mask_key(&generated.plaintext),
        "created api key"
    );

    let display = keys::format_display(owner, app_name, machine, &generated.key_hint);
    Ok((
        StatusCode::CREATED,
        Json(CreatedKey {
            id,
            key: generated.plaintext,
            display,
        }),
    )
        .into_response())
}

/// `POST /admin/keys/{id}/disable`
async fn handle_disable_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, AdminError> {
    if !keys::disable_key(&state.db, id).await? {
        return Err(AdminError::NotFound);
    }
    info!(%id, "disabled api key");
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ---------------------------------------------------------------------------
// Traffic views
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, sqlx::FromRow)]
struct RecentRow {
    method: String,
    path: String,
    status: i32,
    created_at: DateTime<Utc>,
    display: String,
}

/// `GET /admin/recent` - the newest retained request-log rows.
async fn handle_recent(State(state): State<Arc<AppState>>) -> Result<Response, AdminError> {
    let rows: Vec<RecentRow> = sqlx::query_as(
        "SELECT rl.method, rl.path, rl.status, rl.created_at, \
                COALESCE(ak.owner || '_' || ak.app_name || '_' || ak.machine || \
                         CASE WHEN ak.key_hint <> '' THEN '_' || ak.key_hint ELSE '' END, \
                         '') AS display \
         FROM request_logs rl \
         LEFT JOIN api_keys ak ON ak.key_hash = rl.api_key \
         ORDER BY rl.id DESC LIMIT 1000",
    )
    .fetch_all(&state.db)
    .await
    .map_err(|e| AdminError::Internal(e.into()))?;
    Ok(Json(rows).into_response())
}

/// `GET /admin/stats`
async fn handle_stats(State(state): State<Arc<AppState>>) -> Response {
    Json(crate::proxy::stats_snapshot(&state).await).into_response()
}

// ---------------------------------------------------------------------------
// Live updates
// ---------------------------------------------------------------------------

/// `GET /admin/ws` - stream hub events to a dashboard.
async fn handle_ws(State(state): State<Arc<AppState>>, upgrade: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();
    upgrade.on_upgrade(move |socket| async move {
        let subscription = hub.subscribe().await;
        client_session(socket, subscription).await;
    })
}

/// One connected dashboard: a write pump forwarding hub events (with a
/// keep-alive ping) and a read pump draining client frames. The hub drops
/// us if our queue backs up, which surfaces here as a closed receiver.
async fn client_session(socket: WebSocket, mut subscription: Subscription) {
    let (mut sink, mut stream) = socket.split();

    let write = tokio::spawn(async move {
        let mut ping = tokio::time::interval(WS_PING_INTERVAL);
        loop {
            tokio::select! {
                event = subscription.receiver.recv() => match event {
                    Some(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    write.abort();
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum AdminError {
    BadRequest(String),
    NotFound,
    Internal(anyhow::Error),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        match self {
            AdminError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AdminError::NotFound => StatusCode::NOT_FOUND.into_response(),
            AdminError::Internal(err) => {
                error!(error = %err, "admin handler error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AdminError {
    fn from(err: anyhow::Error) -> Self {
        AdminError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            database_url: String::new(),
            base_url: "http://localhost:8080".to_string(),
            admin_user: "admin".to_string(),
            admin_pass: "hunter2".to_string(),
            max_cache_time: 300,
            max_cache_size_mb: 100,
            db_max_conns: 20,
            max_proxy_body_bytes: 1_048_576,
        }
    }

    fn basic_header(user: &str, pass: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        headers.insert(AUTHORIZATION, format!("Basic {encoded}").parse().unwrap());
        headers
    }

    #[test]
    fn correct_credentials_pass() {
        assert!(authorized(&test_config(), &basic_header("admin", "hunter2")));
    }

    #[test]
    fn wrong_password_fails() {
        assert!(!authorized(&test_config(), &basic_header("admin", "wrong")));
    }

    #[test]
    fn wrong_user_fails() {
        assert!(!authorized(&test_config(), &basic_header("root", "hunter2")));
    }

    #[test]
    fn missing_header_fails() {
        assert!(!authorized(&test_config(), &HeaderMap::new()));
    }

    #[test]
    fn non_basic_scheme_fails() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer token".parse().unwrap());
        assert!(!authorized(&test_config(), &headers));
    }

    #[test]
    fn malformed_base64_fails() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Basic !!!".parse().unwrap());
        assert!(!authorized(&test_config(), &headers));
    }
}
