//! Fixed-attempt, fixed-delay retry for remote calls, on top of `backoff`.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::backoff::Constant;
use backoff::future::retry_notify;
use backoff::Error as BackoffError;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

/// Runs `op` until it succeeds or the attempts are used up, sleeping `delay`
/// between attempts. The last error is returned.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let attempt_counter = AtomicU32::new(0);

    retry_notify(
        Constant::new(policy.delay),
        || {
            let attempt = attempt_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let fut = op();
            async move {
                fut.await.map_err(|e| {
                    if attempt < attempts {
                        BackoffError::transient(e)
                    } else {
                        BackoffError::permanent(e)
                    }
                })
            }
        },
        |e: E, wait: Duration| {
            warn!(
                what,
                attempt = attempt_counter.load(Ordering::Relaxed),
                attempts,
                wait_ms = wait.as_millis() as u64,
                error = %e,
                "[RETRY] Attempt failed, retrying"
            );
        },
    )
    .await
}
