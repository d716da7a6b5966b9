//! Client-token derivation and recycling (spec §4.F.7, §6)
//!
//! A client token is the SHA-256 hex digest of `volumeName`, or of
//! `volumeName + "-" + counter` once a prior create on that name has come
//! back as `IdempotentParameterMismatch`. The counter lives in the
//! client-token cache (sliding 1h TTL) keyed by volume name; it starts at 2
//! on first mismatch and increments on every subsequent one, so it quietly
//! expires from the cache after an hour of inactivity rather than needing
//! explicit cleanup.

use crate::cache::ExpiringCache;
use sha2::{Digest, Sha256};

pub type TokenCounterCache = ExpiringCache<String, u32>;

/// Hash `base` into a 64-character lowercase hex client token.
pub fn hash_token(base: &str) -> String {
    let digest = Sha256::digest(base.as_bytes());
    hex::encode(digest)
}

fn derive(volume_name: &str, counter: Option<u32>) -> String {
    let base = match counter {
        Some(n) => format!("{volume_name}-{n}"),
        None => volume_name.to_string(),
    };
    hash_token(&base)
}

/// Compute the client token to use for the next `CreateVolume` attempt on
/// `volume_name`, honoring any counter left behind by a prior mismatch.
pub async fn next_client_token(cache: &TokenCounterCache, volume_name: &str) -> String {
    let counter = cache.get(&volume_name.to_string()).await.map(|c| *c);
    derive(volume_name, counter)
}

/// Record an `IdempotentParameterMismatch` for `volume_name`: bump (or
/// initialize to 2) the retry counter so the next call derives a different
/// token. Returns the new counter value.
pub async fn record_idempotent_mismatch(cache: &TokenCounterCache, volume_name: &str) -> u32 {
    let next = match cache.get(&volume_name.to_string()).await {
        Some(current) => *current + 1,
        None => 2,
    };
    cache.set(volume_name.to_string(), next).await;
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn token_is_64_hex_chars() {
        let token = hash_token("my-volume");
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn token_depends_on_counter() {
        assert_ne!(derive("n", None), derive("n", Some(2)));
        assert_ne!(derive("n", Some(2)), derive("n", Some(3)));
    }

    #[tokio::test]
    async fn recycling_sequence_bumps_2_then_3() {
        let cache: TokenCounterCache = ExpiringCache::new(Duration::from_secs(3600));
        let first = next_client_token(&cache, "test-vol-client-token").await;
        assert_eq!(first, hash_token("test-vol-client-token"));

        let counter = record_idempotent_mismatch(&cache, "test-vol-client-token").await;
        assert_eq!(counter, 2);
        let second = next_client_token(&cache, "test-vol-client-token").await;
        assert_eq!(second, hash_token("test-vol-client-token-2"));

        let counter = record_idempotent_mismatch(&cache, "test-vol-client-token").await;
        assert_eq!(counter, 3);
        let third = next_client_token(&cache, "test-vol-client-token").await;
        assert_eq!(third, hash_token("test-vol-client-token-3"));

        cache.shutdown();
    }
}
