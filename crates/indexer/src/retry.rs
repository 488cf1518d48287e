//! Backoff-retry for transient failures.
//!
//! Only errors classified transient by [`Error::is_transient`] are retried;
//! a definitive rejection surfaces immediately.

use std::future::Future;
use std::time::Duration;

use quarry_core::Error;

/// Retry schedule: a fixed number of attempts with exponentially growing
/// delays between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first try included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, initial_delay: Duration::from_millis(500), multiplier: 2.0 }
    }
}

impl From<&quarry_core::AppConfig> for RetryPolicy {
    fn from(config: &quarry_core::AppConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts,
            initial_delay: config.retry_base_delay(),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor)
    }
}

/// Run `op` until it succeeds, fails non-transiently, or exhausts the
/// policy's attempts. Returns the last error on exhaustion.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!("{} succeeded on attempt {}", what, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    "{} attempt {}/{} failed ({}), retrying in {:?}",
                    what,
                    attempt,
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
