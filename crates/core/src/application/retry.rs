// Retry logic: batch-level retry decisions and jittered exponential backoff
use crate::domain::{BatchJob, JobStatus};
use crate::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the batch; `attempt` is the retry count it will carry
    Retry { attempt: i64 },
    /// Failed, and the retry budget is spent
    Exhausted,
    /// Not failed, nothing to retry
    NotFailed,
}

/// Batch-level retry policy
///
/// A failed batch is retried while `retry_count < max_retries`. There is no
/// delay of its own: the poll interval plus jitter spaces attempts out.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn should_retry(&self, batch: &BatchJob) -> RetryDecision {
        if batch.status != JobStatus::Failed {
            return RetryDecision::NotFailed;
        }

        if !batch.can_retry() {
            warn!(
                batch_id = %batch.id,
                retry_count = batch.retry_count,
                max_retries = batch.max_retries,
                "Batch retry budget exhausted"
            );
            return RetryDecision::Exhausted;
        }

        info!(
            batch_id = %batch.id,
            attempt = batch.retry_count + 1,
            max_retries = batch.max_retries,
            "Scheduling batch retry"
        );
        RetryDecision::Retry {
            attempt: batch.retry_count + 1,
        }
    }
}

/// Exponential backoff with a cap and proportional jitter
///
/// delay(n) = min(initial * 2^n, max) * (1 ± jitter)
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Fraction of the delay, 0.0..=1.0
    pub jitter: f64,
    /// Retries after the first attempt
    pub retry_limit: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: 0.1,
            retry_limit: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }

    /// Run `op` until it succeeds or the retry limit is spent.
    /// Returns the last error.
    pub async fn retry<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retry_limit => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        op = op_name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
