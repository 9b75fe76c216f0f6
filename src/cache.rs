//! Durable response cache backed by the `cached_responses` table.
//!
//! Rows are append-only: `put` inserts, `get` reads the newest non-expired
//! row for a fingerprint, and the janitor's `sweep` deletes. Concurrent
//! misses may insert duplicates for one fingerprint; newest-row-wins makes
//! that harmless.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::fingerprint::sha256_hex;

/// Upstream response headers as stored in the cache row.
pub type HeaderBlob = HashMap<String, Vec<String>>;

/// A cache hit.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: HeaderBlob,
    pub body: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub expired_deleted: u64,
    pub trimmed: u64,
    pub table_bytes: i64,
}

// ---------------------------------------------------------------------------
// ResponseCache
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ResponseCache {
    pool: PgPool,
    max_age_secs: i64,
    max_size_mb: i64,
}

impl ResponseCache {
    /// `max_age_secs` of zero disables expiry; `max_size_mb` of zero
    /// disables the size trim.
    pub fn new(pool: PgPool, max_age_secs: i64, max_size_mb: i64) -> Self {
        Self {
            pool,
            max_age_secs,
            max_size_mb,
        }
    }

    /// Return the most recently inserted non-expired row for
    /// `(method, url, hash(body))`. Store errors degrade to a miss.
    pub async fn get(&self, method: &str, url: &str, body: &[u8]) -> Option<CachedResponse> {
        match self.try_get(method, url, body).await {
            Ok(hit) => hit,
            Err(error) => {
                warn!(%error, "cache get failed; treating as miss");
                None
            }
        }
    }

    async fn try_get(&self, method: &str, url: &str, body: &[u8]) -> Result<Option<CachedResponse>> {
        let row: Option<(i32, Json<HeaderBlob>, Vec<u8>)> = sqlx::query_as(
            "SELECT status, resp_headers, resp_body FROM cached_responses \
             WHERE method = $1 AND url = $2 AND content_hash = $3 \
               AND (expires_at IS NULL OR expires_at > now()) \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(method)
        .bind(url)
        .bind(sha256_hex(body))
        .fetch_optional(&self.pool)
        .await
        .context("cache lookup query failed")?;

        Ok(row.map(|(status, Json(headers), resp_body)| CachedResponse {
            status: status.clamp(0, i32::from(u16::MAX)) as u16,
            headers,
            body: resp_body,
        }))
    }

    /// Append a row for a successful cacheable response. The expiry is
    /// `now + TTL`, or absent when the TTL is zero.
    pub async fn put(
        &self,
        method: &str,
        url: &str,
        req_body: &[u8],
        status: u16,
        headers: &HeaderBlob,
        resp_body: &[u8],
    ) -> Result<()> {
        let expires_at = compute_expiry(self.max_age_secs, Utc::now());
        sqlx::query(
            "INSERT INTO cached_responses \
                 (method, url, req_body, content_hash, status, resp_headers, resp_body, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(method)
        .bind(url)
        .bind(req_body)
        .bind(sha256_hex(req_body))
        .bind(i32::from(status))
        .bind(Json(headers))
        .bind(resp_body)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("cache insert failed")?;
        Ok(())
    }

    /// Best-effort eviction: drop expired rows, then trim the oldest ~10%
    /// if the table footprint exceeds the configured cap. Exact LRU is not
    /// required; the next sweep re-evaluates.
    pub async fn sweep(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();

        let expired = sqlx::query(
            "DELETE FROM cached_responses WHERE expires_at IS NOT NULL AND expires_at <= now()",
        )
        .execute(&self.pool)
        .await
        .context("expired-row delete failed")?;
        stats.expired_deleted = expired.rows_affected();

        if self.max_size_mb <= 0 {
            return Ok(stats);
        }

        let (table_bytes,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(pg_total_relation_size('cached_responses')::bigint, 0)",
        )
        .fetch_one(&self.pool)
        .await
        .context("cache size query failed")?;
        stats.table_bytes = table_bytes;

        if table_bytes <= self.max_size_mb * 1024 * 1024 {
            return Ok(stats);
        }

        let trimmed = sqlx::query(
            "DELETE FROM cached_responses WHERE id IN ( \
                 SELECT id FROM cached_responses ORDER BY created_at ASC \
                 LIMIT (SELECT GREATEST(1, (SELECT count(*) FROM cached_responses) / 10)))",
        )
        .execute(&self.pool)
        .await
        .context("cache size trim failed")?;
        stats.trimmed = trimmed.rows_affected();

        debug!(
            trimmed = stats.trimmed,
            table_mb = table_bytes / 1024 / 1024,
            "cache trimmed to enforce size cap"
        );
        Ok(stats)
    }
}

/// Expiry for a new row: `now + ttl`, or `None` when the TTL is zero.
fn compute_expiry(max_age_secs: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if max_age_secs > 0 {
        Some(now + Duration::seconds(max_age_secs))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ttl_means_no_expiry() {
        assert_eq!(compute_expiry(0, Utc::now()), None);
    }

    #[test]
    fn positive_ttl_sets_future_expiry() {
        let now = Utc::now();
        let expiry = compute_expiry(300, now).unwrap();
        assert_eq!(expiry, now + Duration::seconds(300));
    }
}
