//! Upstream GitHub API client.
//!
//! Executes proxied calls with a token chosen from the donated pool, marks
//! dead tokens revoked, and schedules the fire-and-forget `/rate_limit`
//! probe that keeps per-category snapshots fresh.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::HeaderBlob;
use crate::credentials::{should_revoke, Category, CredentialPool};

const ACCEPT_HEADER: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "gh-proxy/1.0";
const RATE_LIMIT_URL: &str = "https://api.github.com/rate_limit";

/// Hard timeout for a proxied upstream call.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
/// Shorter timeout for the background snapshot probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_IDLE_PER_HOST: usize = 8;

/// Categories the proxy accounts for; other buckets in the introspection
/// payload are ignored.
const TRACKED_CATEGORIES: [&str; 4] = ["core", "search", "code_search", "graphql"];

// ---------------------------------------------------------------------------
// Response type
// ---------------------------------------------------------------------------

/// The donor whose token served a request.
#[derive(Debug, Clone)]
pub struct UsedToken {
    pub id: Uuid,
    pub github_user: String,
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderBlob,
    pub body: Vec<u8>,
    pub used: UsedToken,
    /// The response proved the token dead and it was marked revoked.
    pub revoked: bool,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Build the shared reqwest client for upstream calls: connection pool
/// keyed by host with a conservative idle cap, and the hard per-request
/// timeout.
pub fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(UPSTREAM_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .build()
        .context("failed to build upstream http client")
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    credentials: CredentialPool,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, credentials: CredentialPool) -> Self {
        Self { http, credentials }
    }

    /// Execute one proxied call against the upstream.
    ///
    /// `Ok(None)` means no donated tokens were available; transport errors
    /// propagate. A `401`/bad-credentials `403` marks the token revoked but
    /// still returns the upstream's status and body so the caller can
    /// forward the real error.
    pub async fn execute(
        &self,
        method: &str,
        url: &str,
        body: &[u8],
    ) -> Result<Option<UpstreamResponse>> {
        let category = Category::classify(url);
        let Some(candidate) = self.credentials.choose(category).await? else {
            return Ok(None);
        };

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .with_context(|| format!("invalid method: {method}"))?;

        let response = self
            .http
            .request(method, url)
            .header("Accept", ACCEPT_HEADER)
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("Authorization", format!("Bearer {}", candidate.token))
            .body(body.to_vec())
            .send()
            .await
            .context("upstream request failed")?;

        let status = response.status().as_u16();
        let headers = header_blob(response.headers());
        let bytes = response
            .bytes()
            .await
            .context("failed to read upstream response body")?;

        let used = UsedToken {
            id: candidate.id,
            github_user: candidate.github_user.clone(),
        };

        let revoked = should_revoke(status, &bytes);
        if revoked {
            self.credentials
                .mark_revoked(candidate.id, &candidate.github_user)
                .await;
        } else {
            self.spawn_snapshot_refresh(candidate.id, candidate.token.clone());
        }

        Ok(Some(UpstreamResponse {
            status,
            headers,
            body: bytes.to_vec(),
            used,
            revoked,
        }))
    }

    /// Probe `/rate_limit` for the token just used and upsert the four
    /// category snapshots. Runs detached so it never delays the response.
    fn spawn_snapshot_refresh(&self, token_id: Uuid, token: String) {
        let http = self.http.clone();
        let credentials = self.credentials.clone();
        tokio::spawn(async move {
            if let Err(error) = refresh_snapshots(&http, &credentials, token_id, &token).await {
                debug!(%error, "rate-limit snapshot refresh failed");
            }
        });
    }
}

async fn refresh_snapshots(
    http: &reqwest::Client,
    credentials: &CredentialPool,
    token_id: Uuid,
    token: &str,
) -> Result<()> {
    let response = http
        .get(RATE_LIMIT_URL)
        .header("Accept", ACCEPT_HEADER)
        .header("Authorization", format!("Bearer {token}"))
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .context("rate_limit probe failed")?;

    let body = response
        .bytes()
        .await
        .context("rate_limit probe body read failed")?;

    for (category, limit, remaining, reset) in parse_rate_limits(&body)? {
        credentials
            .upsert_snapshot(token_id, &category, limit, remaining, reset)
            .await?;
    }
    credentials.touch_last_ok(token_id).await?;
    Ok(())
}

/// Parse the `/rate_limit` introspection payload into the tracked category
/// snapshots.
fn parse_rate_limits(body: &[u8]) -> Result<Vec<(String, i32, i32, DateTime<Utc>)>> {
    #[derive(Deserialize)]
    struct RateResource {
        limit: i32,
        remaining: i32,
        reset: i64,
    }

    #[derive(Deserialize)]
    struct RateLimitPayload {
        #[serde(default)]
        resources: HashMap<String, RateResource>,
    }

    let payload: RateLimitPayload =
        serde_json::from_slice(body).context("unparseable rate_limit payload")?;

    let mut snapshots = Vec::new();
    for (name, resource) in payload.resources {
        if !TRACKED_CATEGORIES.contains(&name.as_str()) {
            continue;
        }
        let reset = Utc
            .timestamp_opt(resource.reset, 0)
            .single()
            .unwrap_or_else(Utc::now);
        snapshots.push((name, resource.limit, resource.remaining, reset));
    }
    if snapshots.is_empty() {
        warn!("rate_limit payload carried no tracked categories");
    }
    Ok(snapshots)
}

/// Collect response headers into the storable multi-value map.
fn header_blob(headers: &reqwest::header::HeaderMap) -> HeaderBlob {
    let mut blob: HeaderBlob = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            blob.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    blob
}
