//! Deadline-bounded retry of transient store failures

use crate::error::Result;
use crate::identity::Deadline;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff parameters
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for a single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): 50ms → 100ms → 200ms … capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.initial_backoff * 2u32.saturating_pow(attempt.min(16));
        backoff.min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the next
/// backoff would cross `deadline`. Conflicts and transient store errors are
/// retried; every other error is returned immediately.
pub async fn retry_transient<T, F, Fut>(
    deadline: Deadline,
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                let delay = policy.delay(attempt);
                if deadline.remaining() <= delay {
                    return Err(e);
                }
                warn!(
                    operation = %operation,
                    error = %e,
                    retry = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient store error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
