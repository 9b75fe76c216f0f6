//! Cache-key derivation for proxied requests.
//!
//! A fingerprint is `(method, canonical URL, SHA-256 of the body bytes)`.
//! Two requests collide iff all three components are equal; digest
//! collisions are cryptographically negligible.

use sha2::{Digest, Sha256};

/// The cache key for a proxied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub method: String,
    pub url: String,
    pub body_hash: String,
}

impl Fingerprint {
    /// Derive the fingerprint for `(method, url, body)`. The URL must
    /// already be canonicalized (see [`canonical_url`]). An absent body is
    /// hashed as the empty byte string.
    pub fn derive(method: &str, url: &str, body: &[u8]) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            body_hash: sha256_hex(body),
        }
    }
}

/// Hex-encoded SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Join the rewritten target URL with the incoming raw query string.
///
/// An empty query leaves the target untouched; otherwise the query is
/// appended verbatim after `?`, or `&` when the target already carries one.
pub fn canonical_url(target: &str, raw_query: &str) -> String {
    if raw_query.is_empty() {
        return target.to_string();
    }
    if target.contains('?') {
        format!("{target}&{raw_query}")
    } else {
        format!("{target}?{raw_query}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Digest ───────────────────────────────────────────────────────

    #[test]
    fn empty_body_hashes_to_known_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = Fingerprint::derive("GET", "https://api.github.com/user", b"abc");
        let b = Fingerprint::derive("GET", "https://api.github.com/user", b"abc");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_each_component() {
        let base = Fingerprint::derive("GET", "https://api.github.com/user", b"");
        assert_ne!(
            base,
            Fingerprint::derive("HEAD", "https://api.github.com/user", b"")
        );
        assert_ne!(
            base,
            Fingerprint::derive("GET", "https://api.github.com/users", b"")
        );
        assert_ne!(
            base,
            Fingerprint::derive("GET", "https://api.github.com/user", b"x")
        );
    }

    // ── URL canonicalization ─────────────────────────────────────────

    #[test]
    fn empty_query_omits_separator() {
        assert_eq!(
            canonical_url("https://api.github.com/user", ""),
            "https://api.github.com/user"
        );
    }

    #[test]
    fn query_joined_with_question_mark() {
        assert_eq!(
            canonical_url("https://api.github.com/search/code", "q=foo&page=2"),
            "https://api.github.com/search/code?q=foo&page=2"
        );
    }

    #[test]
    fn existing_query_joined_with_ampersand() {
        assert_eq!(
            canonical_url("https://api.github.com/search/code?q=foo", "page=2"),
            "https://api.github.com/search/code?q=foo&page=2"
        );
    }

    #[test]
    fn raw_query_is_not_reencoded() {
        assert_eq!(
            canonical_url("https://api.github.com/search/code", "q=a%20b"),
            "https://api.github.com/search/code?q=a%20b"
        );
    }
}
