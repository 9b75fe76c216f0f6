//! Donated-token pool: category accounting and rotation.
//!
//! Selection favors the token with the most remaining quota in the
//! requested category, so capacity depletes evenly across the pool instead
//! of round-robin. Exhausted tokens sort by earliest reset, which makes
//! them usable again soonest.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// Upstream rate-limit bucket a request is accounted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Core,
    Search,
    CodeSearch,
    Graphql,
}

impl Category {
    /// Classify an upstream URL into its rate-limit category.
    pub fn classify(url: &str) -> Self {
        if url.contains("/graphql") {
            Category::Graphql
        } else if url.contains("/search/code") {
            Category::CodeSearch
        } else if url.contains("/search/") {
            Category::Search
        } else {
            Category::Core
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Core => "core",
            Category::Search => "search",
            Category::CodeSearch => "code_search",
            Category::Graphql => "graphql",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// A non-revoked token joined with its snapshot for one category. A token
/// with no snapshot carries `remaining = 0, reset = epoch`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Candidate {
    pub id: Uuid,
    pub github_user: String,
    pub token: String,
    pub remaining: i32,
    pub reset: DateTime<Utc>,
}

/// Pick the candidate with the most remaining calls; among equals, the one
/// whose window resets first. Pure so the policy is testable in isolation.
pub fn best_candidate(mut candidates: Vec<Candidate>) -> Option<Candidate> {
    candidates.sort_by(|a, b| {
        b.remaining
            .cmp(&a.remaining)
            .then_with(|| a.reset.cmp(&b.reset))
    });
    candidates.into_iter().next()
}

/// True when an upstream response proves the token itself is dead: a `401`,
/// or a `403` whose JSON `message` mentions bad credentials. Quota and
/// abuse-detection `403`s keep the token alive.
pub fn should_revoke(status: u16, body: &[u8]) -> bool {
    match status {
        401 => true,
        403 => {
            #[derive(Deserialize)]
            struct ErrorBody {
                #[serde(default)]
                message: String,
            }
            serde_json::from_slice::<ErrorBody>(body)
                .map(|e| e.message.to_lowercase().contains("bad credentials"))
                .unwrap_or(false)
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// CredentialPool
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CredentialPool {
    pool: PgPool,
}

impl CredentialPool {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Choose a token for `category`. `Ok(None)` means the pool holds no
    /// usable tokens at all.
    pub async fn choose(&self, category: Category) -> Result<Option<Candidate>> {
        let candidates: Vec<Candidate> = sqlx::query_as(
            "SELECT t.id, t.github_user, t.token, \
                    COALESCE(r.remaining, 0) AS remaining, \
                    COALESCE(r.reset, 'epoch'::timestamptz) AS reset \
             FROM donated_tokens t \
             LEFT JOIN token_rate_limits r \
                    ON r.token_id = t.id AND r.category = $1 \
             WHERE t.revoked = FALSE",
        )
        .bind(category.as_str())
        .fetch_all(&self.pool)
        .await
        .context("donated token query failed")?;

        Ok(best_candidate(candidates))
    }

    /// Mark a token revoked. It will not be selected again until the donor
    /// re-donates, which clears the flag.
    pub async fn mark_revoked(&self, id: Uuid, github_user: &str) {
        let result = sqlx::query("UPDATE donated_tokens SET revoked = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => warn!(donor = %github_user, "token unauthorized; marked revoked"),
            Err(error) => warn!(%error, donor = %github_user, "failed to mark token revoked"),
        }
    }

    /// Record a successful use of the token.
    pub async fn touch_last_ok(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE donated_tokens SET last_ok_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("last_ok_at update failed")?;
        Ok(())
    }

    /// Upsert one category snapshot for a token.
    pub async fn upsert_snapshot(
        &self,
        token_id: Uuid,
        category: &str,
        limit: i32,
        remaining: i32,
        reset: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO token_rate_limits (token_id, category, rate_limit, remaining, reset, updated_at) \
             VALUES ($1, $2, $3, $4, $5, now()) \
             ON CONFLICT (token_id, category) DO UPDATE SET \
                 rate_limit = EXCLUDED.rate_limit, \
                 remaining = EXCLUDED.remaining, \
                 reset = EXCLUDED.reset, \
                 updated_at = now()",
        )
        .bind(token_id)
        .bind(category)
        .bind(limit)
        .bind(remaining)
        .bind(reset)
        .execute(&self.pool)
        .await
        .context("rate-limit snapshot upsert failed")?;
        Ok(())
    }

    /// Count of non-revoked tokens, for stats.
    pub async fn active_count(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT count(*) FROM donated_tokens WHERE revoked = FALSE")
                .fetch_one(&self.pool)
                .await
                .context("active token count failed")?;
        Ok(count)
    }

    /// Donor login for a token id, for the `X-Gh-Proxy-Donor` header.
    pub async fn donor_login(&self, id: Uuid) -> Option<String> {
        sqlx::query_as::<_, (String,)>("SELECT github_user FROM donated_tokens WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .map(|(login,)| login)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // ── Category classification ──────────────────────────────────────

    #[test]
    fn classify_graphql() {
        assert_eq!(
            Category::classify("https://api.github.com/graphql"),
            Category::Graphql
        );
    }

    #[test]
    fn classify_code_search() {
        assert_eq!(
            Category::classify("https://api.github.com/search/code?q=foo"),
            Category::CodeSearch
        );
    }

    #[test]
    fn classify_search() {
        assert_eq!(
            Category::classify("https://api.github.com/search/issues?q=foo"),
            Category::Search
        );
    }

    #[test]
    fn classify_core() {
        assert_eq!(
            Category::classify("https://api.github.com/repos/acme/widgets"),
            Category::Core
        );
    }

    #[test]
    fn category_wire_names() {
        assert_eq!(Category::CodeSearch.as_str(), "code_search");
        assert_eq!(Category::Graphql.to_string(), "graphql");
    }

    // ── Selection policy ─────────────────────────────────────────────

    fn candidate(user: &str, remaining: i32, reset_ts: i64) -> Candidate {
        Candidate {
            id: Uuid::new_v4(),
            github_user: user.to_string(),
            token: format!("gho_{user}"),
            remaining,
            reset: Utc.timestamp_opt(reset_ts, 0).unwrap(),
        }
    }

    #[test]
    fn most_remaining_wins() {
        let picked = best_candidate(vec![
            candidate("low", 10, 100),
            candidate("high", 4000, 100),
        ])
        .unwrap();
        assert_eq!(picked.github_user, "high");
    }

    #[test]
    fn earliest_reset_breaks_ties() {
        let picked = best_candidate(vec![
            candidate("later", 0, 2_000),
            candidate("sooner", 0, 1_000),
        ])
        .unwrap();
        assert_eq!(picked.github_user, "sooner");
    }

    #[test]
    fn missing_snapshot_sorts_behind_any_snapshot() {
        // A token without a snapshot is joined as remaining 0, reset epoch.
        let picked = best_candidate(vec![
            candidate("unseen", 0, 0),
            candidate("seen", 1, 1_000_000),
        ])
        .unwrap();
        assert_eq!(picked.github_user, "seen");
    }

    #[test]
    fn empty_pool_yields_none() {
        assert!(best_candidate(Vec::new()).is_none());
    }

    // ── Revocation predicate ─────────────────────────────────────────

    #[test]
    fn revoke_on_401() {
        assert!(should_revoke(401, b""));
    }

    #[test]
    fn revoke_on_bad_credentials_403() {
        assert!(should_revoke(403, br#"{"message":"Bad credentials"}"#));
        assert!(should_revoke(403, br#"{"message":"BAD CREDENTIALS"}"#));
    }

    #[test]
    fn quota_403_does_not_revoke() {
        assert!(!should_revoke(
            403,
            br#"{"message":"API rate limit exceeded for user"}"#
        ));
    }

    #[test]
    fn unparseable_403_does_not_revoke() {
        assert!(!should_revoke(403, b"not json"));
    }

    #[test]
    fn success_does_not_revoke() {
        assert!(!should_revoke(200, b""));
    }
}
