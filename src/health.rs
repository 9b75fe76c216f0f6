use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::AppState;

const UPSTREAM_PROBE_URL: &str = "https://api.github.com/meta";

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub database: CheckResult,
    pub upstream: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_database(pool: &sqlx::PgPool) -> CheckResult {
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("SELECT 1 failed: {e}")),
    }
}

async fn check_upstream(client: &reqwest::Client) -> CheckResult {
    match client.head(UPSTREAM_PROBE_URL).send().await {
        Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
            CheckResult::healthy()
        }
        Ok(resp) => CheckResult::unhealthy(format!(
            "HEAD {UPSTREAM_PROBE_URL} returned {}",
            resp.status()
        )),
        Err(e) => CheckResult::unhealthy(format!("HEAD {UPSTREAM_PROBE_URL} failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // The database is required: without it no key can be authenticated.
    // An unreachable upstream only degrades (cached hits still work).
    if checks.database.ok && checks.upstream.ok {
        HealthStatus::Ok
    } else if !checks.database.ok {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler. Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (database, upstream) =
        tokio::join!(check_database(&state.db), check_upstream(&state.http));

    let checks = HealthChecks { database, upstream };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(database: bool, upstream: bool) -> HealthChecks {
        let make = |ok| {
            if ok {
                CheckResult::healthy()
            } else {
                CheckResult::unhealthy("down")
            }
        };
        HealthChecks {
            database: make(database),
            upstream: make(upstream),
        }
    }

    #[test]
    fn all_ok() {
        assert_eq!(aggregate_status(&checks(true, true)), HealthStatus::Ok);
    }

    #[test]
    fn database_down_is_unhealthy() {
        assert_eq!(
            aggregate_status(&checks(false, true)),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn upstream_down_only_degrades() {
        assert_eq!(
            aggregate_status(&checks(true, false)),
            HealthStatus::Degraded
        );
    }
}
