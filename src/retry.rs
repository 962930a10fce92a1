// src/retry.rs
use std::future::Future;
use std::time::Duration;

use crate::error::Retryable;

/// Timeout + bounded retry for idempotent calls (feed fetches, existence lookups).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Extra attempts after the first one.
    pub retries: u32,
    /// Base backoff; doubles with every attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            retries: 2,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A single attempt with the given timeout.
    pub fn once(timeout: Duration) -> Self {
        Self {
            timeout,
            retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << shift)
    }
}

/// Run `call` until it succeeds, fails permanently, or attempts run out.
/// A timed-out attempt counts as a transient failure.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, op: &'static str, mut call: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.retries.saturating_add(1);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(res) => res,
            Err(_) => Err(E::timed_out(policy.timeout)),
        };

        match outcome {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(op, attempt, max_attempts, error = %e, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}
