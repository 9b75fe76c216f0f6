//! Node-local per-API-key admission control.
//!
//! One token bucket per key hash: capacity equals the key's configured
//! requests-per-second, refilled fractionally from elapsed wall time.
//! Buckets live only in memory; a restart refills every bucket to full.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Instant;

const SHARD_COUNT: usize = 16;

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    last: Instant,
}

/// Sharded token-bucket rate limiter keyed by API-key hash.
///
/// Buckets are spread over [`SHARD_COUNT`] independently locked maps so
/// that unrelated keys do not contend on a single mutex.
pub struct RateLimiter {
    shards: Vec<Mutex<HashMap<String, Bucket>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    /// Admit or deny one request for `key_hash` at the configured
    /// per-second rate. A non-positive rate always denies and never
    /// creates a bucket.
    pub fn allow(&self, key_hash: &str, per_sec: i32) -> bool {
        self.allow_at(key_hash, per_sec, Instant::now())
    }

    fn allow_at(&self, key_hash: &str, per_sec: i32, now: Instant) -> bool {
        if per_sec <= 0 {
            return false;
        }

        let shard = &self.shards[shard_index(key_hash)];
        let mut buckets = match shard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let bucket = buckets.entry(key_hash.to_string()).or_insert_with(|| Bucket {
            capacity: f64::from(per_sec),
            tokens: f64::from(per_sec),
            last: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.last = now;
        bucket.tokens = (bucket.tokens + elapsed * f64::from(per_sec)).min(bucket.capacity);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Stable shard index for a key. `DefaultHasher::new()` is deterministic
/// for the lifetime of the process, which is all a volatile limiter needs.
fn shard_index(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_rate_denies_everything() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        assert!(!limiter.allow_at("k", 0, now));
        assert!(!limiter.allow_at("k", -1, now));
    }

    #[test]
    fn fresh_bucket_admits_a_full_burst() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..5 {
            assert!(limiter.allow_at("k", 5, now));
        }
        assert!(!limiter.allow_at("k", 5, now));
    }

    #[test]
    fn tokens_refill_with_elapsed_time() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        assert!(limiter.allow_at("k", 1, start));
        assert!(!limiter.allow_at("k", 1, start));
        assert!(limiter.allow_at("k", 1, start + Duration::from_secs(1)));
    }

    #[test]
    fn refill_is_fractional() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        // Drain the two-token burst.
        assert!(limiter.allow_at("k", 2, start));
        assert!(limiter.allow_at("k", 2, start));
        // 250ms at 2/s refills half a token: still denied.
        assert!(!limiter.allow_at("k", 2, start + Duration::from_millis(250)));
        // Another 250ms reaches one full token.
        assert!(limiter.allow_at("k", 2, start + Duration::from_millis(500)));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        assert!(limiter.allow_at("k", 3, start));
        // A long idle period refills to capacity, not beyond.
        let later = start + Duration::from_secs(60);
        for _ in 0..3 {
            assert!(limiter.allow_at("k", 3, later));
        }
        assert!(!limiter.allow_at("k", 3, later));
    }

    #[test]
    fn keys_have_independent_buckets() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        assert!(limiter.allow_at("a", 1, now));
        assert!(!limiter.allow_at("a", 1, now));
        assert!(limiter.allow_at("b", 1, now));
    }

    #[test]
    fn shard_index_is_stable() {
        assert_eq!(shard_index("some-key"), shard_index("some-key"));
        assert!(shard_index("some-key") < SHARD_COUNT);
    }
}
