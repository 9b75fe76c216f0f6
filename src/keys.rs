//! Proxy-issued client API keys.
//!
//! The plaintext key is shown exactly once at creation; every lookup after
//! that goes through its SHA-256 hash. Logs and the admin surface only see
//! the non-secret hint segment.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::fingerprint::sha256_hex;

const KEY_RANDOM_LEN: usize = 24;
const KEY_HINT_LEN: usize = 6;

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Full API-key row, as listed by the admin surface.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    pub key_hint: String,
    pub owner: String,
    pub app_name: String,
    pub machine: String,
    pub rate_limit_per_sec: i32,
    pub disabled: bool,
    pub total_requests: i64,
    pub total_cached_requests: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Non-secret display form: `{owner}_{app}_{machine}` plus the hint
    /// when one exists.
    pub fn display(&self) -> String {
        format_display(&self.owner, &self.app_name, &self.machine, &self.key_hint)
    }

    /// Share of this key's requests served from cache, as a percentage.
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_cached_requests as f64 * 100.0 / self.total_requests as f64
    }
}

/// The subset of key state the pipeline needs for admission.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct KeyAuth {
    pub disabled: bool,
    pub rate_limit_per_sec: i32,
}

/// A freshly generated key. `plaintext` is never persisted.
#[derive(Debug)]
pub struct GeneratedKey {
    pub plaintext: String,
    pub key_hash: String,
    pub key_hint: String,
}

// ---------------------------------------------------------------------------
// Generation and formatting
// ---------------------------------------------------------------------------

/// Generate a new key of the form `{owner}_{app}_{machine}_{random24}`.
/// The hint is the first six characters of the random segment.
pub fn generate_key(owner: &str, app_name: &str, machine: &str) -> GeneratedKey {
    let random = rand_string(KEY_RANDOM_LEN);
    let plaintext = format!("{owner}_{app_name}_{machine}_{random}");
    let key_hint = random.chars().take(KEY_HINT_LEN).collect();
    GeneratedKey {
        key_hash: sha256_hex(plaintext.as_bytes()),
        plaintext,
        key_hint,
    }
}

/// Cryptographically random string over `[a-z0-9]`.
fn rand_string(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
        .into_iter()
        .map(|b| ALPHABET[b as usize % ALPHABET.len()] as char)
        .collect()
}

pub fn format_display(owner: &str, app_name: &str, machine: &str, hint: &str) -> String {
    let base = format!("{owner}_{app_name}_{machine}");
    if hint.is_empty() {
        base
    } else {
        format!("{base}_{hint}")
    }
}

/// Redact a key for log lines: first six and last four characters.
pub fn mask_key(key: &str) -> String {
    let key = key.trim();
    if key.len() <= 6 {
        return "***".to_string();
    }
    format!("{}...{}", &key[..6], &key[key.len() - 4..])
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

/// Look up admission state for a key hash. `None` means the key does not
/// exist.
pub async fn lookup_auth(pool: &PgPool, key_hash: &str) -> Result<Option<KeyAuth>> {
    sqlx::query_as::<_, KeyAuth>(
        "SELECT disabled, rate_limit_per_sec FROM api_keys WHERE key_hash = $1",
    )
    .bind(key_hash)
    .fetch_optional(pool)
    .await
    .context("api key lookup failed")
}

/// Resolve the display form for a key hash, for the `X-Gh-Proxy-Client`
/// header. Store errors degrade to `None`; the header is best-effort.
pub async fn lookup_display(pool: &PgPool, key_hash: &str) -> Option<String> {
    let row: Option<(String, String, String, String)> = sqlx::query_as(
        "SELECT owner, app_name, machine, key_hint FROM api_keys WHERE key_hash = $1",
    )
    .bind(key_hash)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten();
    row.map(|(owner, app, machine, hint)| format_display(&owner, &app, &machine, &hint))
}

/// Insert a new key row. Returns the new row id.
pub async fn insert_key(
    pool: &PgPool,
    generated: &GeneratedKey,
    owner: &str,
    app_name: &str,
    machine: &str,
    rate_limit_per_sec: i32,
) -> Result<Uuid> {
    let (id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO api_keys (key_hash, key_hint, owner, app_name, machine, rate_limit_per_sec) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
    )
    .bind(&generated.key_hash)
    .bind(&generated.key_hint)
    .bind(owner)
    .bind(app_name)
    .bind(machine)
    .bind(rate_limit_per_sec)
    .fetch_one(pool)
    .await
    .context("api key insert failed")?;
    Ok(id)
}

/// Disable a key. Keys are never deleted; disabling suffices.
pub async fn disable_key(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("UPDATE api_keys SET disabled = TRUE WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("api key disable failed")?;
    Ok(result.rows_affected() > 0)
}

/// List all keys, newest first.
pub async fn list_keys(pool: &PgPool) -> Result<Vec<ApiKey>> {
    sqlx::query_as::<_, ApiKey>(
        "SELECT id, key_hint, owner, app_name, machine, rate_limit_per_sec, disabled, \
                total_requests, total_cached_requests, last_used_at, created_at \
         FROM api_keys ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await
    .context("api key list failed")
}

/// Bump last-used and the usage counters after a proxied request. Failures
/// are swallowed by the caller; usage accounting must never fail a request.
pub async fn record_use(pool: &PgPool, key_hash: &str, cache_hit: bool) -> Result<()> {
    sqlx::query(
        "UPDATE api_keys SET last_used_at = now(), \
                total_requests = total_requests + 1, \
                total_cached_requests = total_cached_requests + $2 \
         WHERE key_hash = $1",
    )
    .bind(key_hash)
    .bind(i64::from(cache_hit))
    .execute(pool)
    .await
    .context("api key usage update failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Generation ───────────────────────────────────────────────────

    #[test]
    fn generated_key_has_expected_shape() {
        let generated = generate_key("acme", "ci", "runner1");
        assert!(generated.plaintext.starts_with("acme_ci_runner1_"));
        let random = generated.plaintext.rsplit('_').next().unwrap();
        assert_eq!(random.len(), KEY_RANDOM_LEN);
        assert!(random.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(generated.key_hint, random[..KEY_HINT_LEN].to_string());
    }

    #[test]
    fn hash_matches_plaintext() {
        let generated = generate_key("acme", "ci", "runner1");
        assert_eq!(
            generated.key_hash,
            sha256_hex(generated.plaintext.as_bytes())
        );
    }

    #[test]
    fn successive_keys_differ() {
        let a = generate_key("acme", "ci", "runner1");
        let b = generate_key("acme", "ci", "runner1");
        assert_ne!(a.plaintext, b.plaintext);
    }

    // ── Display ──────────────────────────────────────────────────────

    #[test]
    fn display_includes_hint_when_present() {
        assert_eq!(
            format_display("acme", "ci", "runner1", "ab12cd"),
            "acme_ci_runner1_ab12cd"
        );
    }

    #[test]
    fn display_without_hint() {
        assert_eq!(format_display("acme", "ci", "runner1", ""), "acme_ci_runner1");
    }

    // ── Masking ──────────────────────────────────────────────────────

    #[test]
    fn mask_hides_the_middle() {
        assert_eq!(mask_key("acme_ci_runner1_abcdef123456"), "acme_c...3456");
    }

    #[test]
    fn mask_short_keys_entirely() {
        assert_eq!(mask_key("abc"), "***");
        assert_eq!(mask_key("  abc  "), "***");
    }

    // ── Hit rate ─────────────────────────────────────────────────────

    #[test]
    fn hit_rate_handles_zero_requests() {
        let key = sample_key(0, 0);
        assert_eq!(key.hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_is_a_percentage() {
        let key = sample_key(200, 50);
        assert!((key.hit_rate() - 25.0).abs() < f64::EPSILON);
    }

    fn sample_key(total: i64, cached: i64) -> ApiKey {
        ApiKey {
            id: Uuid::nil(),
            key_hint: "ab12cd".to_string(),
            owner: "acme".to_string(),
            app_name: "ci".to_string(),
            machine: "runner1".to_string(),
            rate_limit_per_sec: 10,
            disabled: false,
            total_requests: total,
            total_cached_requests: cached,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }
}
