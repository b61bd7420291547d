// Scheduler configuration

use super::constants::*;
use crate::application::retry::BackoffPolicy;
use crate::domain::{Priority, DEFAULT_PRIORITY};
use crate::error::{AppError, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub polling_interval: Duration,
    pub worker_pool_size: usize,
    pub jitter_range: Duration,
    pub max_batches_per_poll: usize,
    /// Floor of the lease taken per batch, see `batch_lease`
    pub lock_timeout: Duration,
    /// Hard bound on processing one batch
    pub batch_timeout: Duration,
    /// Bound on a single store call from the poll loop and on final writes
    pub store_timeout: Duration,
    pub default_max_retries: i64,
    pub default_priority: Priority,
    pub activity_concurrency: usize,
    /// Requeue retryable failed batches at the start of every poll
    pub auto_retry: bool,
    pub lock_release_backoff: BackoffPolicy,
    /// Prefix of worker IDs; generated when absent
    pub instance_id: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            jitter_range: DEFAULT_JITTER_RANGE,
            max_batches_per_poll: DEFAULT_MAX_BATCHES_PER_POLL,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_priority: DEFAULT_PRIORITY,
            activity_concurrency: DEFAULT_ACTIVITY_CONCURRENCY,
            auto_retry: true,
            lock_release_backoff: BackoffPolicy::default(),
            instance_id: None,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        let zero = |name: &str| -> Result<()> {
            Err(AppError::Config(format!("{} must be greater than zero", name)))
        };

        if self.worker_pool_size == 0 {
            return zero("worker_pool_size");
        }
        if self.polling_interval.is_zero() {
            return zero("polling_interval");
        }
        if self.max_batches_per_poll == 0 {
            return zero("max_batches_per_poll");
        }
        if self.activity_concurrency == 0 {
            return zero("activity_concurrency");
        }
        if self.lock_timeout.is_zero() {
            return zero("lock_timeout");
        }
        if self.batch_timeout.is_zero() {
            return zero("batch_timeout");
        }
        if self.store_timeout.is_zero() {
            return zero("store_timeout");
        }
        if self.default_max_retries < 0 {
            return Err(AppError::Config(
                "default_max_retries must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Lease a worker requests for one batch
    ///
    /// Covers the batch deadline plus one bounded final write, so the outcome
    /// lands before another instance can reclaim the batch. Never shorter
    /// than `lock_timeout`.
    pub fn batch_lease(&self) -> Duration {
        self.lock_timeout
            .max(self.batch_timeout.saturating_add(self.store_timeout))
    }
}
