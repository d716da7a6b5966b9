//! Expiring cache (component A)
//!
//! A concurrent keyed store with a sliding per-entry TTL. Backs the IOPS
//! limits cache, the client-token retry-counter cache, the
//! likely-bad-device-names cache, and the volume-initialization-SLA cache
//! (spec §4.A).
//!
//! Every `get` hit and every `set` resets the entry's expiry to `ttl` from
//! now. A background task sweeps expired entries periodically; it takes the
//! same lock `get`/`set` use, so a `set`/`get` racing the sweep always wins —
//! an entry is only ever removed if it is still expired under the lock that
//! removes it. The background sweeper is owned by the cache and stopped
//! explicitly on drop, per the "background task lifetime" design note
//! (nothing here relies on process exit to reclaim it).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

struct Entry<V> {
    value: Arc<V>,
    expires_at: Instant,
}

struct Inner<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

/// A generic sliding-TTL cache. Cloning an `ExpiringCache` shares the
/// underlying store and the single background sweeper (it is a handle, like
/// `Arc`).
pub struct ExpiringCache<K, V> {
    inner: Arc<Inner<K, V>>,
    shutdown: Arc<Notify>,
}

impl<K, V> Clone for ExpiringCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a cache with sliding expiration `ttl`, swept roughly every
    /// `ttl / 4` (clamped to at least one second so a short TTL in tests
    /// doesn't spin the sweeper).
    pub fn new(ttl: Duration) -> Self {
        let inner = Arc::new(Inner {
            ttl,
            entries: Mutex::new(HashMap::new()),
        });
        let shutdown = Arc::new(Notify::new());

        let sweep_interval = (ttl / 4).max(Duration::from_secs(1));
        let sweep_inner = inner.clone();
        let sweep_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(sweep_interval) => {
                        let now = Instant::now();
                        let mut entries = sweep_inner.entries.lock().await;
                        entries.retain(|_, entry| entry.expires_at > now);
                    }
                    _ = sweep_shutdown.notified() => break,
                }
            }
        });

        Self { inner, shutdown }
    }

    /// Look up `key`. A hit resets the entry's sliding expiry to `ttl` from
    /// now. The returned value is shared (`Arc`) and must be treated as
    /// read-only by callers — concurrent readers may observe the same
    /// allocation.
    pub async fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut entries = self.inner.entries.lock().await;
        let entry = entries.get_mut(key)?;
        entry.expires_at = Instant::now() + self.inner.ttl;
        Some(entry.value.clone())
    }

    /// Insert or replace `key`, resetting its sliding expiry to `ttl` from
    /// now.
    pub async fn set(&self, key: K, value: V) {
        let mut entries = self.inner.entries.lock().await;
        entries.insert(
            key,
            Entry {
                value: Arc::new(value),
                expires_at: Instant::now() + self.inner.ttl,
            },
        );
    }

    /// Number of live (non-expired-as-of-last-sweep) entries. Test/debug use
    /// only.
    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Stop the background sweeper. The owner of a cache (the orchestrator,
    /// or a test) is responsible for calling this on teardown; the sweeper
    /// does not tie its lifetime to any single clone being dropped.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn set_then_get_hits() {
        let cache: ExpiringCache<String, u32> = ExpiringCache::new(Duration::from_secs(60));
        cache.set("a".to_string(), 1).await;
        assert_eq!(*cache.get(&"a".to_string()).await.unwrap(), 1);
        cache.shutdown();
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let cache: ExpiringCache<String, u32> = ExpiringCache::new(Duration::from_secs(60));
        assert!(cache.get(&"missing".to_string()).await.is_none());
        cache.shutdown();
    }

    #[tokio::test]
    async fn get_resets_sliding_expiry() {
        let cache: ExpiringCache<String, u32> = ExpiringCache::new(Duration::from_millis(200));
        cache.set("a".to_string(), 1).await;
        sleep(Duration::from_millis(120)).await;
        // still alive, and this get slides the expiry forward again
        assert!(cache.get(&"a".to_string()).await.is_some());
        sleep(Duration::from_millis(120)).await;
        assert!(cache.get(&"a".to_string()).await.is_some());
        cache.shutdown();
    }

    #[tokio::test]
    async fn entry_expires_without_access() {
        let cache: ExpiringCache<String, u32> = ExpiringCache::new(Duration::from_millis(100));
        cache.set("a".to_string(), 1).await;
        sleep(Duration::from_millis(500)).await;
        assert!(cache.get(&"a".to_string()).await.is_none());
        cache.shutdown();
    }
}
