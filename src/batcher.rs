//! Request batcher (component D)
//!
//! Coalesces many concurrent single-key lookups into a bounded number of
//! bulk provider calls. Generic over the task key and the per-key result;
//! nothing here knows about volumes, snapshots, or instances (spec §9:
//! "treat as its own component with a generic task/result protocol").
//!
//! A batch accumulates keys until either `max_entries` distinct keys have
//! been queued or `max_delay` has elapsed since the first key of the
//! current batch, whichever comes first, then `fire` is called exactly
//! once with the deduplicated key list. Every waiter for a key present in
//! the returned map gets that value; a key absent from the map is
//! delivered as `Ok(None)` ("not found"); if `fire` itself fails, every
//! waiter in the batch gets that error.

use crate::error::{DiskError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::warn;

/// What a waiter receives: `Some(value)` on a hit, `None` if the key was
/// absent from the bulk result, or the shared error if the whole call
/// failed.
pub type BatchResult<V> = std::result::Result<Option<V>, Arc<DiskError>>;

type FireFn<K, V> = Arc<
    dyn Fn(Vec<K>) -> Pin<Box<dyn Future<Output = Result<HashMap<K, V>>> + Send>> + Send + Sync,
>;

/// Provider bulk calls get their own deadline, independent of any caller's
/// cancellation (spec §5: "the batcher uses an internal 30s timeout
/// independent of caller ctx").
const FIRE_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingBatch<K, V> {
    tasks: HashMap<K, Vec<oneshot::Sender<BatchResult<V>>>>,
    fire_now: Arc<Notify>,
}

struct Inner<K, V> {
    max_entries: usize,
    max_delay: Duration,
    fire: FireFn<K, V>,
    current: Mutex<Option<PendingBatch<K, V>>>,
}

/// A single batcher instance. Cloning shares the underlying batch state.
pub struct Batcher<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Batcher<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Batcher<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(max_entries: usize, max_delay: Duration, fire: F) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<K, V>>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                max_entries,
                max_delay,
                fire: Arc::new(move |keys| Box::pin(fire(keys))),
                current: Mutex::new(None),
            }),
        }
    }

    /// Queue `key` and await its result from whichever batch eventually
    /// fires. Non-blocking beyond the brief queueing step (spec §4.D).
    pub async fn get(&self, key: K) -> BatchResult<V> {
        let (tx, rx) = oneshot::channel();
        self.add_task(key, tx).await;
        rx.await.unwrap_or_else(|_| {
            Err(Arc::new(DiskError::Internal(
                "batcher dropped the result sender".to_string(),
            )))
        })
    }

    async fn add_task(&self, key: K, tx: oneshot::Sender<BatchResult<V>>) {
        let mut current = self.inner.current.lock().await;

        if current.is_none() {
            let fire_now = Arc::new(Notify::new());
            *current = Some(PendingBatch {
                tasks: HashMap::new(),
                fire_now: fire_now.clone(),
            });
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(inner.max_delay) => {}
                    _ = fire_now.notified() => {}
                }
                Self::fire_current_batch(&inner).await;
            });
        }

        let batch = current.as_mut().expect("just ensured Some");
        batch.tasks.entry(key).or_default().push(tx);
        if batch.tasks.len() >= self.inner.max_entries {
            batch.fire_now.notify_one();
        }
    }

    async fn fire_current_batch(inner: &Arc<Inner<K, V>>) {
        let batch = {
            let mut current = inner.current.lock().await;
            current.take()
        };
        let Some(batch) = batch else {
            // Another firing (e.g. triggered by the max-entries notify
            // racing the timer) already took this batch.
            return;
        };

        let keys: Vec<K> = batch.tasks.keys().cloned().collect();
        let outcome = tokio::time::timeout(FIRE_TIMEOUT, (inner.fire)(keys)).await;

        match outcome {
            Ok(Ok(mut results)) => {
                for (key, senders) in batch.tasks {
                    let value = results.remove(&key);
                    for tx in senders {
                        let _ = tx.send(Ok(value.clone()));
                    }
                }
            }
            Ok(Err(err)) => {
                let shared = Arc::new(err);
                for (_, senders) in batch.tasks {
                    for tx in senders {
                        let _ = tx.send(Err(shared.clone()));
                    }
                }
            }
            Err(_) => {
                warn!("batcher fire call exceeded {:?} timeout", FIRE_TIMEOUT);
                let shared = Arc::new(DiskError::TimedOut {
                    operation: "batch fire".to_string(),
                    resource_id: String::new(),
                });
                for (_, senders) in batch.tasks {
                    for tx in senders {
                        let _ = tx.send(Err(shared.clone()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn single_task_gets_its_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let batcher: Batcher<String, i32> = Batcher::new(10, Duration::from_millis(20), move |keys| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(keys.into_iter().map(|k| (k, 42)).collect())
            }
        });
        let result = batcher.get("a".to_string()).await.unwrap();
        assert_eq!(result, Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_tasks_for_same_key_share_one_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let batcher: Batcher<String, i32> = Batcher::new(10, Duration::from_millis(50), move |keys| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(keys.into_iter().map(|k| (k, 7)).collect())
            }
        });
        let b1 = batcher.clone();
        let b2 = batcher.clone();
        let (r1, r2) = tokio::join!(b1.get("shared".to_string()), b2.get("shared".to_string()));
        assert_eq!(r1.unwrap(), Some(7));
        assert_eq!(r2.unwrap(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_key_delivers_none() {
        let batcher: Batcher<String, i32> =
            Batcher::new(10, Duration::from_millis(20), |_keys| async { Ok(HashMap::new()) });
        let result = batcher.get("missing".to_string()).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn fire_error_is_shared_by_all_waiters() {
        let batcher: Batcher<String, i32> = Batcher::new(10, Duration::from_millis(50), |_keys| async {
            Err(DiskError::Provider("boom".to_string()))
        });
        let b2 = batcher.clone();
        let (r1, r2) = tokio::join!(batcher.get("a".to_string()), b2.get("b".to_string()));
        assert!(r1.is_err());
        assert!(r2.is_err());
    }

    #[tokio::test]
    async fn max_entries_fires_before_delay_elapses() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let batcher: Batcher<String, i32> = Batcher::new(2, Duration::from_secs(60), move |keys| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(keys.into_iter().map(|k| (k, 1)).collect())
            }
        });
        let b2 = batcher.clone();
        let (r1, r2) = tokio::join!(batcher.get("a".to_string()), b2.get("b".to_string()));
        assert_eq!(r1.unwrap(), Some(1));
        assert_eq!(r2.unwrap(), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_in_one_window_share_a_single_fire() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let batcher: Batcher<String, i32> = Batcher::new(10, Duration::from_millis(30), move |keys| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(keys.into_iter().map(|k| (k.clone(), k.len() as i32)).collect())
            }
        });
        let b2 = batcher.clone();
        let (r1, r2) = tokio::join!(batcher.get("aa".to_string()), b2.get("bbb".to_string()));
        assert_eq!(r1.unwrap(), Some(2));
        assert_eq!(r2.unwrap(), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
