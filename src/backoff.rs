//! Reusable exponential backoff primitive (spec §9: "polling loops with
//! exponential backoff are first-class; express as a reusable primitive
//! rather than open-coding `(duration, factor, steps)` per site").
//!
//! Parameterizes the four poll loops in the orchestrator: volume creation
//! (§4.F.1 step 8), attachment state (§4.F.3), volume modification
//! (§4.F.4), and the initialization ETA wait (§4.F.6).

use crate::cancel::CancelToken;
use crate::error::{DiskError, Result};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    factor: f64,
    steps: u32,
}

impl Backoff {
    pub fn new(initial: Duration, factor: f64, steps: u32) -> Self {
        Self {
            initial,
            factor,
            steps,
        }
    }

    /// Volume creation poll: ~500ms x 1.5^n, 11 steps (spec §4.F.1 step 8).
    pub fn creation() -> Self {
        Self::new(Duration::from_millis(500), 1.5, 11)
    }

    /// Attachment state poll: base 1s, factor 1.8, 13 steps, ~2601s total
    /// (spec §4.F.3).
    pub fn attachment() -> Self {
        Self::new(Duration::from_secs(1), 1.8, 13)
    }

    /// Volume modification poll, same shape as the creation poll (spec
    /// §4.F.4 gives no distinct constants).
    pub fn modification() -> Self {
        Self::creation()
    }

    pub fn total_steps(&self) -> u32 {
        self.steps
    }

    pub fn delay_for_step(&self, step: u32) -> Duration {
        let millis = self.initial.as_millis() as f64 * self.factor.powi(step as i32);
        Duration::from_millis(millis as u64)
    }
}

/// What a single poll attempt reports back to [`poll_with_backoff`].
pub enum PollOutcome<T> {
    Done(T),
    Retry,
}

/// Run `attempt` up to `backoff.total_steps()` times, sleeping
/// `backoff.delay_for_step(n)` between attempts (an optional
/// `initial_delay` is slept once before the first attempt, per the
/// creation poll's "sleep the initial delay, then poll" shape). Returns
/// [`DiskError::TimedOut`] if every attempt reports `Retry`, or
/// [`DiskError::Cancelled`] if `cancel` fires first.
pub async fn poll_with_backoff<T, F, Fut>(
    backoff: &Backoff,
    initial_delay: Option<Duration>,
    cancel: &CancelToken,
    operation: &str,
    resource_id: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollOutcome<T>>>,
{
    if let Some(delay) = initial_delay {
        if sleep_or_cancel(delay, cancel).await.is_err() {
            return Err(DiskError::Cancelled);
        }
    }

    for step in 0..backoff.total_steps() {
        if cancel.is_cancelled() {
            return Err(DiskError::Cancelled);
        }
        match attempt(step).await? {
            PollOutcome::Done(value) => return Ok(value),
            PollOutcome::Retry => {
                if step + 1 == backoff.total_steps() {
                    break;
                }
                if sleep_or_cancel(backoff.delay_for_step(step), cancel)
                    .await
                    .is_err()
                {
                    return Err(DiskError::Cancelled);
                }
            }
        }
    }

    Err(DiskError::TimedOut {
        operation: operation.to_string(),
        resource_id: resource_id.to_string(),
    })
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancelToken) -> std::result::Result<(), ()> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_as_soon_as_attempt_reports_done() {
        let backoff = Backoff::new(Duration::from_millis(1), 1.0, 5);
        let cancel = CancelToken::new();
        let calls = AtomicU32::new(0);
        let result = poll_with_backoff(&backoff, None, &cancel, "op", "id", |_step| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 2 {
                    Ok(PollOutcome::Done(n))
                } else {
                    Ok(PollOutcome::Retry)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn times_out_when_every_attempt_retries() {
        let backoff = Backoff::new(Duration::from_millis(1), 1.0, 3);
        let cancel = CancelToken::new();
        let result: Result<()> =
            poll_with_backoff(&backoff, None, &cancel, "wait", "vol-1", |_step| async {
                Ok(PollOutcome::Retry)
            })
            .await;
        assert!(matches!(result, Err(DiskError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_the_poll() {
        let backoff = Backoff::new(Duration::from_secs(30), 1.0, 20);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result: Result<()> =
            poll_with_backoff(&backoff, None, &cancel, "wait", "vol-1", |_step| async {
                Ok(PollOutcome::Retry)
            })
            .await;
        assert!(matches!(result, Err(DiskError::Cancelled)));
    }
}
