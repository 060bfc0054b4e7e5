// Retry with exponential backoff for remote fetches.
//
// Remote calls fail transiently (timeouts, 5xx, rate limits). A collection
// cycle retries each call a bounded number of times before giving up on
// the whole cycle; the next scheduled cycle starts fresh.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1),
    /// capped, with +/-25% jitter from the clock's sub-second part.
    fn delay(&self, retry: u32) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << retry.saturating_sub(1).min(16))
            .min(self.max_delay);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let jitter = 0.75 + f64::from(nanos % 500) / 1000.0;
        Duration::from_secs_f64(backoff.as_secs_f64() * jitter)
    }
}

/// Run `operation` until it succeeds or the policy's attempts run out.
/// The last error is returned.
pub async fn with_retry<F, Fut, T>(policy: RetryPolicy, what: &str, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.attempts => return Err(err),
            Err(err) => {
                let wait = policy.delay(attempt);
                warn!(
                    what,
                    attempt,
                    max_attempts = policy.attempts,
                    backoff_secs = wait.as_secs_f64(),
                    error = %err,
                    "Fetch failed, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}
