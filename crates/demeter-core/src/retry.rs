//! Explicit retry composition: one higher-order function wrapped around a
//! call site, parameterized by predicate, attempt budget, and backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, ErrorKind};

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the given retry (1-indexed): base, 2*base, 4*base, ... capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << shift);
        std::cmp::min(delay, self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

/// Run `operation` up to `max_attempts` times, sleeping per `policy`
/// between attempts for which `should_retry` returns true. The final
/// error is returned unchanged once attempts are exhausted.
pub async fn retry_with_backoff<T, F, Fut, P>(
    mut operation: F,
    should_retry: P,
    max_attempts: u32,
    policy: BackoffPolicy,
) -> Result<T, AppError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
    P: Fn(ErrorKind) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts || !should_retry(err.kind()) {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
