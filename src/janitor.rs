//! Periodic maintenance: cache sweeps and request-log trimming.
//!
//! Both loops are best-effort. A tick that fails or overruns its budget is
//! logged and retried on the next tick; neither loop can fail a request.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::metrics::MetricsRegistry;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SWEEP_BUDGET: Duration = Duration::from_secs(30);
const LOG_TRIM_INTERVAL: Duration = Duration::from_secs(10);
const LOG_TRIM_BUDGET: Duration = Duration::from_secs(2);
/// Rows kept in `request_logs`; the table feeds the admin views, not the
/// metrics, so a short tail is enough.
const LOG_KEEP_ROWS: i64 = 1000;

/// Sweep the response cache once a minute.
pub async fn run_cache_janitor(cache: ResponseCache, metrics: MetricsRegistry) {
    let mut ticker = interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        match timeout(SWEEP_BUDGET, cache.sweep()).await {
            Ok(Ok(stats)) => {
                let deleted = stats.expired_deleted + stats.trimmed;
                if deleted > 0 {
                    metrics.metrics.cache_evictions_total.inc_by(deleted);
                    debug!(
                        expired = stats.expired_deleted,
                        trimmed = stats.trimmed,
                        "cache sweep deleted rows"
                    );
                }
                metrics.metrics.cache_table_bytes.set(stats.table_bytes);
            }
            Ok(Err(error)) => warn!(%error, "cache sweep failed"),
            Err(_) => warn!("cache sweep exceeded its time budget"),
        }
    }
}

/// Trim the request log to its retained tail every ten seconds.
pub async fn run_log_janitor(pool: PgPool) {
    let mut ticker = interval(LOG_TRIM_INTERVAL);
    loop {
        ticker.tick().await;
        match timeout(LOG_TRIM_BUDGET, trim_request_logs(&pool)).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => warn!(%error, "request log trim failed"),
            Err(_) => warn!("request log trim exceeded its time budget"),
        }
    }
}

async fn trim_request_logs(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM request_logs \
         WHERE id <= GREATEST((SELECT COALESCE(MAX(id), 0) FROM request_logs) - $1, 0)",
    )
    .bind(LOG_KEEP_ROWS)
    .execute(pool)
    .await
    .context("request log delete failed")?;
    Ok(result.rows_affected())
}
