// Scheduler constants (no magic values)
use std::time::Duration;

/// Default time between poll cycles (30s)
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of batches processed concurrently
pub const DEFAULT_WORKER_POOL_SIZE: usize = 5;

/// Default upper bound of the random delay added to each poll interval (5s)
pub const DEFAULT_JITTER_RANGE: Duration = Duration::from_secs(5);

/// Default number of batches fetched per poll cycle
pub const DEFAULT_MAX_BATCHES_PER_POLL: usize = 10;

/// Default lock lease (5 minutes). Bounds how long a crashed worker blocks a batch.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default per-batch processing bound (5 minutes)
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default bound for one store call made outside a batch deadline (30s)
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Activities processed concurrently inside one batch
pub const DEFAULT_ACTIVITY_CONCURRENCY: usize = 4;

/// Consecutive failed polls before health reports `degraded`
pub const DEGRADED_AFTER_POLL_FAILURES: u32 = 3;
