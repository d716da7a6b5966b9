//! Adaptive per-API retry and dry-run liveness (component E)
//!
//! Mirrors the shape of the teacher's `ExponentialBackoffPolicy` but adds the
//! two things the orchestration core needs that a CLI doesn't: one retryer
//! *per mutating provider API* (so a throttled `CreateVolume` doesn't slow
//! down an unrelated `DeleteSnapshot`), and the periodic dry-run liveness
//! flag described in spec §4.E.

use crate::error::{DiskError, IsRetryable, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_INITIAL_RETRY_DELAY_MS: u64 = 100;
const DEFAULT_MAX_RETRY_DELAY_SECS: u64 = 30;
const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// A retryer caps attempts high enough that a caller-imposed deadline wins
/// before attempts are exhausted (spec §4.E: "caps attempts at a high number,
/// e.g. 50").
pub const MAX_ATTEMPTS: u32 = 50;

/// The names of the mutating provider APIs the orchestrator retries
/// individually (spec §4.E).
pub const MUTATING_APIS: &[&str] = &[
    "create_volume",
    "delete_volume",
    "attach_volume",
    "detach_volume",
    "modify_volume",
    "create_snapshot",
    "delete_snapshot",
    "enable_fast_snapshot_restore",
    "describe_volumes_modifications_unbatched",
];

/// Retry policy trait.
///
/// `async fn` in a trait trips a clippy lint about auto-trait bounds; this is
/// acceptable here, same call as the teacher's `RetryPolicy` makes.
#[allow(async_fn_in_trait)]
pub trait RetryPolicy: Send + Sync {
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send;
}

/// Exponential backoff with jitter, plus an adaptive cooldown that widens
/// when the wrapped calls keep coming back as throttled.
pub struct AdaptiveRetryer {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    /// Millis since UNIX epoch before which new attempts should back off an
    /// extra beat; widened every time a throttling error is observed,
    /// narrowed back down as calls succeed. `0` means no extra cooldown.
    throttle_cooldown_until_ms: AtomicU64,
}

impl AdaptiveRetryer {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_RETRY_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_RETRY_DELAY_SECS),
            jitter_factor: DEFAULT_JITTER_FACTOR,
            throttle_cooldown_until_ms: AtomicU64::new(0),
        }
    }

    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponential = self.initial_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let delay_ms = exponential.min(self.max_delay.as_millis() as f64);
        let jitter = delay_ms * self.jitter_factor * fastrand::f64();
        Duration::from_millis((delay_ms + jitter) as u64)
    }

    fn note_throttled(&self) {
        let now = now_ms();
        self.throttle_cooldown_until_ms
            .store(now + 2_000, Ordering::Relaxed);
    }

    async fn wait_out_cooldown(&self) {
        let until = self.throttle_cooldown_until_ms.load(Ordering::Relaxed);
        let now = now_ms();
        if until > now {
            tokio::time::sleep(Duration::from_millis(until - now)).await;
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl RetryPolicy for AdaptiveRetryer {
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            self.wait_out_cooldown().await;

            match f().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if is_throttling(&e) {
                        self.note_throttled();
                    }

                    if !e.is_retryable() {
                        warn!("non-retryable error, aborting: {}", e);
                        return Err(e);
                    }

                    if attempt == self.max_attempts - 1 {
                        warn!("max retries ({}) reached", self.max_attempts);
                        return Err(DiskError::Retryable {
                            attempt: attempt + 1,
                            max_attempts: self.max_attempts,
                            reason: format!("{}", e),
                            source: Some(Box::new(e)),
                        });
                    }

                    let backoff = self.calculate_backoff(attempt);
                    debug!(
                        "retryable error (attempt {}/{}), retrying in {:?}: {}",
                        attempt + 1,
                        self.max_attempts,
                        backoff,
                        e
                    );
                    last_error = Some(e);
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DiskError::Retryable {
            attempt: self.max_attempts,
            max_attempts: self.max_attempts,
            reason: "unknown error".to_string(),
            source: None,
        }))
    }
}

fn is_throttling(err: &DiskError) -> bool {
    matches!(err, DiskError::Provider(msg) if msg.to_lowercase().contains("throttl")
        || msg.to_lowercase().contains("requestlimitexceeded"))
}

/// No-op policy, used where retrying would be wrong (e.g. a caller-supplied
/// dry-run probe that must fail exactly once to be parsed).
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        f().await
    }
}

/// Owns one [`AdaptiveRetryer`] per mutating provider API (component E).
pub struct RetryManager {
    retryers: Mutex<HashMap<&'static str, Arc<AdaptiveRetryer>>>,
}

impl RetryManager {
    pub fn new() -> Self {
        let mut retryers = HashMap::new();
        for api in MUTATING_APIS {
            retryers.insert(*api, Arc::new(AdaptiveRetryer::new(MAX_ATTEMPTS)));
        }
        Self {
            retryers: Mutex::new(retryers),
        }
    }

    /// Fetch the retryer for `api`. Panics if `api` is not one of
    /// [`MUTATING_APIS`] — this is a programmer error, not a runtime one.
    pub async fn retryer(&self, api: &str) -> Arc<AdaptiveRetryer> {
        let guard = self.retryers.lock().await;
        guard
            .get(api)
            .cloned()
            .unwrap_or_else(|| panic!("unknown retry API: {api}"))
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Dry-run liveness gate (spec §4.E): at startup and every 3h thereafter,
/// `attempt_dry_run` is set; the next `DryRun()` call clears it after issuing
/// a dry-run describe. Modeled as an atomic boolean toggled by a background
/// task the orchestrator owns, with an explicit shutdown signal rather than
/// relying on process exit (spec §9 design note on background task
/// lifetime).
pub struct DryRunGate {
    attempt_dry_run: Arc<AtomicBool>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl DryRunGate {
    pub fn start(interval: Duration) -> Self {
        let attempt_dry_run = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(tokio::sync::Notify::new());

        let flag = attempt_dry_run.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        flag.store(true, Ordering::Relaxed);
                    }
                    _ = stop.notified() => break,
                }
            }
        });

        Self {
            attempt_dry_run,
            shutdown,
        }
    }

    /// True iff a dry-run probe should be issued on the next call. Does not
    /// clear the flag: the caller only clears it once the probe actually
    /// confirms liveness (`clear`), since an unrelated provider failure
    /// should leave the flag set for the next attempt.
    pub fn should_probe(&self) -> bool {
        self.attempt_dry_run.load(Ordering::Acquire)
    }

    /// Clear the flag after a successful liveness probe.
    pub fn clear(&self) {
        self.attempt_dry_run.store(false, Ordering::Release);
    }
}

impl Drop for DryRunGate {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn succeeds_without_retry() {
        let retryer = AdaptiveRetryer::new(3);
        let calls = AtomicU32::new(0);
        let result = retryer
            .execute_with_retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DiskError>(42)
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_errors_then_succeeds() {
        let retryer = AdaptiveRetryer::new(5);
        let calls = AtomicU32::new(0);
        let result = retryer
            .execute_with_retry(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(DiskError::Provider("throttled".to_string()))
                } else {
                    Ok::<_, DiskError>("ok")
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_aborts_immediately() {
        let retryer = AdaptiveRetryer::new(5);
        let calls = AtomicU32::new(0);
        let result = retryer
            .execute_with_retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(DiskError::InvalidArgument("bad".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dry_run_gate_fires_once() {
        let gate = DryRunGate::start(Duration::from_secs(3600));
        assert!(gate.should_probe());
        gate.clear();
        assert!(!gate.should_probe());
    }
}
