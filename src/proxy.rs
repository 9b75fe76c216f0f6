//! Main axum router and the proxied-request pipeline.
//!
//! Routes:
//! - `ANY /gh/graphql`   - proxy to the upstream GraphQL endpoint
//! - `ANY /gh/{*rest}`   - proxy to the upstream REST API
//! - `GET /healthz`      - health check
//! - `GET /metrics`      - Prometheus metrics
//! - `/admin/*`          - basic-auth admin surface (see `admin`)
//!
//! The pipeline for a proxied request: authenticate the API key, bound the
//! body, admit through the per-key token bucket, consult the response
//! cache for idempotent methods, otherwise fetch upstream with a donated
//! token, store cacheable results, and emit the response through the
//! header filter.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{HeaderName, CONTENT_LENGTH};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::cache::HeaderBlob;
use crate::credentials::Category;
use crate::events::{Event, RecentRequest, StatsSnapshot};
use crate::fingerprint::{canonical_url, sha256_hex};
use crate::keys::{self, mask_key};
use crate::metrics::{CacheLabels, CacheOutcome, CategoryLabels};
use crate::AppState;

const GITHUB_API_BASE: &str = "https://api.github.com";

/// Hop-by-hop headers are never forwarded across the proxy.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers that would leak upstream session state or transport-length
/// claims through the trust boundary.
const BLOCKED_RESPONSE_HEADERS: [&str; 4] = [
    "set-cookie",
    "strict-transport-security",
    "public-key-pins",
    "content-length",
];

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/gh/graphql", any(handle_graphql))
        .route("/gh/{*rest}", any(handle_rest))
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .merge(crate::admin::router(Arc::clone(&state)))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `ANY /gh/{*rest}` - REST pass-through, method and query preserved.
async fn handle_rest(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
    request: Request,
) -> Response {
    let target = format!("{GITHUB_API_BASE}/{rest}");
    serve_proxy(state, request, target).await
}

/// `ANY /gh/graphql` - GraphQL pass-through.
async fn handle_graphql(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let target = format!("{GITHUB_API_BASE}/graphql");
    serve_proxy(state, request, target).await
}

/// `GET /metrics` - Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(error) => {
            error!(%error, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[instrument(skip(state, request), fields(%target))]
async fn serve_proxy(state: Arc<AppState>, request: Request, target: String) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let raw_query = parts.uri.query().unwrap_or("").to_string();

    // 1. Authenticate: X-API-Key, trimmed; lookups go through the hash only.
    let api_key = parts
        .headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim()
        .to_string();
    if api_key.is_empty() {
        return (StatusCode::UNAUTHORIZED, "missing X-API-Key").into_response();
    }
    let key_hash = sha256_hex(api_key.as_bytes());

    let auth = match keys::lookup_auth(&state.db, &key_hash).await {
        Ok(auth) => auth,
        Err(error) => {
            warn!(%error, "api key lookup failed");
            None
        }
    };
    let Some(auth) = auth else {
        info!(key = %mask_key(&api_key), "deny unknown api key");
        return (StatusCode::FORBIDDEN, "api key disabled").into_response();
    };
    if auth.disabled {
        info!(key = %mask_key(&api_key), "deny disabled api key");
        return (StatusCode::FORBIDDEN, "api key disabled").into_response();
    }

    // 2. Bound the incoming body before buffering it.
    let max_bytes = state.config.max_proxy_body_bytes;
    let declared_len = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > max_bytes) {
        return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
    }
    let body = match axum::body::to_bytes(body, max_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    // 3. Per-key admission.
    if !state.ratelimit.allow(&key_hash, auth.rate_limit_per_sec) {
        info!(key = %mask_key(&api_key), "rate limit exceeded");
        state.metrics.metrics.rate_limited_total.inc();
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }

    // 4-5. Cache lookup for idempotent methods.
    let cacheable = method == Method::GET || method == Method::HEAD;
    let full_target = canonical_url(&target, &raw_query);
    let category = Category::classify(&full_target);

    if cacheable {
        if let Some(hit) = state.cache.get(method.as_str(), &full_target, &body).await {
            let display = keys::lookup_display(&state.db, &key_hash).await;
            let response = build_response(
                hit.status,
                &hit.headers,
                hit.body,
                CacheOutcome::Hit,
                category,
                display.as_deref(),
                None,
            );
            after_request(
                &state,
                &key_hash,
                method.as_str(),
                &path,
                hit.status,
                true,
                display.unwrap_or_default(),
            )
            .await;
            return response;
        }
    }

    // 6. Upstream fetch with a donated token.
    state
        .metrics
        .metrics
        .upstream_calls_total
        .get_or_create(&CategoryLabels {
            category: category.to_string(),
        })
        .inc();

    let (status, headers, resp_body, donor) =
        match state.upstream.execute(method.as_str(), &full_target, &body).await {
            Ok(Some(upstream)) => {
                if upstream.revoked {
                    state.metrics.metrics.token_revocations_total.inc();
                }
                (
                    upstream.status,
                    upstream.headers,
                    upstream.body,
                    Some(upstream.used),
                )
            }
            Ok(None) => {
                error!("no donated tokens available");
                (502, HeaderBlob::new(), Vec::new(), None)
            }
            Err(error) => {
                error!(%error, "upstream call failed");
                (502, HeaderBlob::new(), Vec::new(), None)
            }
        };

    // 7. Store successful cacheable responses, unless the upstream forbids it.
    if cacheable && status == 200 && cache_control_allows(&headers) {
        if let Err(error) = state
            .cache
            .put(method.as_str(), &full_target, &body, status, &headers, &resp_body)
            .await
        {
            warn!(%error, "cache put failed");
        }
    }

    // 8. Emit through the header filter.
    let display = keys::lookup_display(&state.db, &key_hash).await;
    let donor_login = donor.map(|used| used.github_user);
    let response = build_response(
        status,
        &headers,
        resp_body,
        CacheOutcome::Miss,
        category,
        display.as_deref(),
        donor_login.as_deref(),
    );

    // 9. Post-actions: log row, usage counters, live events.
    after_request(
        &state,
        &key_hash,
        method.as_str(),
        &path,
        status,
        false,
        display.unwrap_or_default(),
    )
    .await;
    response
}

// ---------------------------------------------------------------------------
// Post-actions
// ---------------------------------------------------------------------------

async fn after_request(
    state: &AppState,
    key_hash: &str,
    method: &str,
    path: &str,
    status: u16,
    cache_hit: bool,
    display: String,
) {
    state.total_requests.fetch_add(1, Ordering::Relaxed);
    if cache_hit {
        state.cache_hits.fetch_add(1, Ordering::Relaxed);
    }
    let outcome = if cache_hit {
        CacheOutcome::Hit
    } else {
        CacheOutcome::Miss
    };
    state
        .metrics
        .metrics
        .requests_total
        .get_or_create(&CacheLabels { cache: outcome })
        .inc();

    // Log-row insertion and usage accounting never fail a request.
    let logged = sqlx::query(
        "INSERT INTO request_logs (api_key, method, path, status, cache_hit) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(key_hash)
    .bind(method)
    .bind(path)
    .bind(i32::from(status))
    .bind(cache_hit)
    .execute(&state.db)
    .await;
    if let Err(error) = logged {
        warn!(%error, "request log insert failed");
    }
    if let Err(error) = keys::record_use(&state.db, key_hash, cache_hit).await {
        warn!(%error, "usage accounting failed");
    }

    info!(
        method,
        path,
        status,
        source = if cache_hit { "cache" } else { "origin" },
        "proxied request"
    );

    state.hub.broadcast(Event::Recent(RecentRequest {
        method: method.to_string(),
        path: path.to_string(),
        created_at: Utc::now(),
        display,
    }));
    state.hub.broadcast(Event::Stats(stats_snapshot(state).await));
}

/// Aggregate counters for the live dashboard and `/admin/stats`.
pub async fn stats_snapshot(state: &AppState) -> StatsSnapshot {
    let hit_pct = sqlx::query_as::<_, (f64,)>(
        "SELECT COALESCE(AVG(CASE WHEN cache_hit THEN 1.0 ELSE 0.0 END) * 100, 0)::float8 \
         FROM request_logs",
    )
    .fetch_one(&state.db)
    .await
    .map(|(pct,)| pct)
    .unwrap_or(0.0);

    let today = sqlx::query_as::<_, (i64,)>(
        "SELECT count(*) FROM request_logs WHERE created_at::date = now()::date",
    )
    .fetch_one(&state.db)
    .await
    .map(|(count,)| count)
    .unwrap_or(0);

    let active_tokens = state.credentials.active_count().await.unwrap_or(0);

    StatsSnapshot {
        total_requests: state.total_requests.load(Ordering::Relaxed),
        cache_hit_rate: format!("{hit_pct:.1}%"),
        today,
        active_tokens,
    }
}

// ---------------------------------------------------------------------------
// Response assembly
// ---------------------------------------------------------------------------

fn build_response(
    status: u16,
    upstream_headers: &HeaderBlob,
    body: Vec<u8>,
    outcome: CacheOutcome,
    category: Category,
    client: Option<&str>,
    donor: Option<&str>,
) -> Response {
    let mut headers = HeaderMap::new();
    copy_filtered(&mut headers, upstream_headers);

    let cache_value = match outcome {
        CacheOutcome::Hit => "hit",
        CacheOutcome::Miss => "miss",
    };
    headers.insert(
        HeaderName::from_static("x-gh-proxy-cache"),
        HeaderValue::from_static(cache_value),
    );
    headers.insert(
        HeaderName::from_static("x-gh-proxy-category"),
        HeaderValue::from_static(category.as_str()),
    );
    if let Some(client) = client {
        if let Ok(value) = HeaderValue::from_str(client) {
            headers.insert(HeaderName::from_static("x-gh-proxy-client"), value);
        }
    }
    if let Some(donor) = donor {
        if let Ok(value) = HeaderValue::from_str(donor) {
            headers.insert(HeaderName::from_static("x-gh-proxy-donor"), value);
        }
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = headers;
    response
}

/// Copy stored/upstream headers onto the client response, dropping the
/// hop-by-hop and security-boundary sets case-insensitively.
fn copy_filtered(dst: &mut HeaderMap, src: &HeaderBlob) {
    for (name, values) in src {
        if is_filtered_header(name) {
            continue;
        }
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(header_value) = HeaderValue::from_str(value) {
                dst.append(header_name.clone(), header_value);
            }
        }
    }
}

fn is_filtered_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP_HEADERS.contains(&lower.as_str())
        || BLOCKED_RESPONSE_HEADERS.contains(&lower.as_str())
}

/// A `200` may only be cached when the upstream did not mark it
/// `no-cache` or `no-store`.
fn cache_control_allows(headers: &HeaderBlob) -> bool {
    for (name, values) in headers {
        if !name.eq_ignore_ascii_case("cache-control") {
            continue;
        }
        for value in values {
            let lower = value.to_ascii_lowercase();
            if lower.contains("no-cache") || lower.contains("no-store") {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Header filtering ─────────────────────────────────────────────

    #[test]
    fn every_hop_by_hop_header_is_filtered() {
        for name in HOP_BY_HOP_HEADERS {
            assert!(is_filtered_header(name), "{name} should be filtered");
        }
    }

    #[test]
    fn every_security_boundary_header_is_filtered() {
        for name in BLOCKED_RESPONSE_HEADERS {
            assert!(is_filtered_header(name), "{name} should be filtered");
        }
    }

    #[test]
    fn filtering_is_case_insensitive() {
        assert!(is_filtered_header("Set-Cookie"));
        assert!(is_filtered_header("TRANSFER-ENCODING"));
        assert!(is_filtered_header("Content-Length"));
    }

    #[test]
    fn ordinary_headers_pass() {
        assert!(!is_filtered_header("content-type"));
        assert!(!is_filtered_header("x-ratelimit-remaining"));
        assert!(!is_filtered_header("etag"));
    }

    #[test]
    fn copy_filtered_drops_blocked_and_keeps_the_rest() {
        let mut src = HeaderBlob::new();
        src.insert("Content-Type".to_string(), vec!["application/json".to_string()]);
        src.insert("Set-Cookie".to_string(), vec!["session=abc".to_string()]);
        src.insert("Connection".to_string(), vec!["close".to_string()]);
        src.insert(
            "vary".to_string(),
            vec!["Accept".to_string(), "Authorization".to_string()],
        );

        let mut dst = HeaderMap::new();
        copy_filtered(&mut dst, &src);

        assert_eq!(dst.get("content-type").unwrap(), "application/json");
        assert!(dst.get("set-cookie").is_none());
        assert!(dst.get("connection").is_none());
        assert_eq!(dst.get_all("vary").iter().count(), 2);
    }

    // ── Cache-control gate ───────────────────────────────────────────

    #[test]
    fn absent_cache_control_allows_store() {
        assert!(cache_control_allows(&HeaderBlob::new()));
    }

    #[test]
    fn no_store_blocks() {
        let mut headers = HeaderBlob::new();
        headers.insert(
            "Cache-Control".to_string(),
            vec!["private, no-store".to_string()],
        );
        assert!(!cache_control_allows(&headers));
    }

    #[test]
    fn no_cache_blocks_case_insensitively() {
        let mut headers = HeaderBlob::new();
        headers.insert("cache-control".to_string(), vec!["No-Cache".to_string()]);
        assert!(!cache_control_allows(&headers));
    }

    #[test]
    fn other_directives_allow_store() {
        let mut headers = HeaderBlob::new();
        headers.insert(
            "cache-control".to_string(),
            vec!["private, max-age=60".to_string()],
        );
        assert!(cache_control_allows(&headers));
    }

    // ── Response assembly ────────────────────────────────────────────

    #[test]
    fn debug_headers_are_set_on_hits() {
        let response = build_response(
            200,
            &HeaderBlob::new(),
            b"{}".to_vec(),
            CacheOutcome::Hit,
            Category::Core,
            Some("acme_ci_runner1_ab12cd"),
            None,
        );
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("x-gh-proxy-cache").unwrap(), "hit");
        assert_eq!(headers.get("x-gh-proxy-category").unwrap(), "core");
        assert_eq!(
            headers.get("x-gh-proxy-client").unwrap(),
            "acme_ci_runner1_ab12cd"
        );
        assert!(headers.get("x-gh-proxy-donor").is_none());
    }

    #[test]
    fn donor_header_is_set_on_misses_with_a_token() {
        let response = build_response(
            200,
            &HeaderBlob::new(),
            Vec::new(),
            CacheOutcome::Miss,
            Category::Graphql,
            None,
            Some("octocat"),
        );
        let headers = response.headers();
        assert_eq!(headers.get("x-gh-proxy-cache").unwrap(), "miss");
        assert_eq!(headers.get("x-gh-proxy-category").unwrap(), "graphql");
        assert_eq!(headers.get("x-gh-proxy-donor").unwrap(), "octocat");
    }

    #[test]
    fn invalid_status_degrades_to_bad_gateway() {
        let response = build_response(
            0,
            &HeaderBlob::new(),
            Vec::new(),
            CacheOutcome::Miss,
            Category::Core,
            None,
            None,
        );
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
