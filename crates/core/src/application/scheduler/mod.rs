// Batch Scheduler - polling loop, worker pool and lock-guarded dispatch

pub mod config;
pub mod constants;
mod panic_guard;
mod shutdown;
pub mod stats;
mod worker;

pub use config::SchedulerConfig;
pub use panic_guard::{execute_guarded_async, panic_message, PanicGuardResult};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
pub use stats::{HealthState, HealthStatus, SchedulerStats};

use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::domain::{BatchId, BatchJob, Priority};
use crate::error::{AppError, Result};
use crate::port::id_provider::{generate_instance_id, RandomBatchIdProvider};
use crate::port::{ActivityProcessor, BatchStore, IdProvider, SystemTimeProvider, TimeProvider};
use rand::Rng;
use serde::{Deserialize, Serialize};
use stats::StatsRecorder;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use worker::bounded;

/// Submission with every knob exposed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitBatchRequest {
    pub org_id: String,
    pub workspace_id: String,
    pub activity_ids: Vec<String>,
    /// Falls back to `SchedulerConfig::default_max_retries`
    #[serde(default)]
    pub max_retries: Option<i64>,
    pub priority: Priority,
}

struct RunState {
    shutdown: ShutdownSender,
    poll_handle: JoinHandle<()>,
}

pub(crate) struct Inner {
    store: Arc<dyn BatchStore>,
    processor: Arc<dyn ActivityProcessor>,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,
    config: SchedulerConfig,
    instance_id: String,
    worker_seq: AtomicU64,
    running: AtomicBool,
    pool: Arc<Semaphore>,
    pool_permits: u32,
    stats: StatsRecorder,
    retry_policy: RetryPolicy,
    run: Mutex<Option<RunState>>,
}

/// Batch scheduler
///
/// One poll loop plus up to `worker_pool_size` batch tasks. Exclusive
/// execution per batch comes from the store's lock, not from any lock held
/// here.
pub struct BatchScheduler {
    inner: Arc<Inner>,
}

impl BatchScheduler {
    /// Create a scheduler with all dependencies injected
    ///
    /// # Errors
    /// - AppError::Config if the configuration is invalid
    pub fn new(
        store: Arc<dyn BatchStore>,
        processor: Arc<dyn ActivityProcessor>,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pool_permits = u32::try_from(config.worker_pool_size)
            .map_err(|_| AppError::Config("worker_pool_size is too large".to_string()))?;
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(generate_instance_id);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                processor,
                time_provider,
                id_provider,
                pool: Arc::new(Semaphore::new(config.worker_pool_size)),
                pool_permits,
                config,
                instance_id,
                worker_seq: AtomicU64::new(0),
                running: AtomicBool::new(false),
                stats: StatsRecorder::default(),
                retry_policy: RetryPolicy,
                run: Mutex::new(None),
            }),
        })
    }

    /// System clock and random batch IDs
    pub fn with_defaults(
        store: Arc<dyn BatchStore>,
        processor: Arc<dyn ActivityProcessor>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        Self::new(
            store,
            processor,
            Arc::new(SystemTimeProvider),
            Arc::new(RandomBatchIdProvider),
            config,
        )
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the poll loop
    ///
    /// # Errors
    /// - AppError::AlreadyRunning on a second start
    /// - AppError::Internal outside a Tokio runtime
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::Internal(format!("no async runtime: {}", e)))?;

        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::AlreadyRunning);
        }

        let config = &self.inner.config;

        let (shutdown, token) = shutdown_channel();
        let poll_handle = runtime.spawn(poll_loop(Arc::clone(&self.inner), token));
        *self.inner.run.lock().unwrap_or_else(PoisonError::into_inner) = Some(RunState {
            shutdown,
            poll_handle,
        });

        info!(
            instance_id = %self.inner.instance_id,
            polling_interval_ms = config.polling_interval.as_millis() as u64,
            worker_pool_size = config.worker_pool_size,
            jitter_range_ms = config.jitter_range.as_millis() as u64,
            max_batches_per_poll = config.max_batches_per_poll,
            lock_timeout_ms = config.lock_timeout.as_millis() as u64,
            batch_timeout_ms = config.batch_timeout.as_millis() as u64,
            batch_lease_ms = config.batch_lease().as_millis() as u64,
            auto_retry = config.auto_retry,
            "Batch scheduler started"
        );
        Ok(())
    }

    /// Stop polling and wait for in-flight batches
    ///
    /// # Errors
    /// - AppError::NotRunning if the scheduler was not started
    /// - AppError::ShutdownTimeout if batches are still running after `timeout`;
    ///   they keep running and release their locks when they finish
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Err(AppError::NotRunning);
        }

        let run = self
            .inner
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(run) = run else {
            return Ok(());
        };

        info!(instance_id = %self.inner.instance_id, "Stopping batch scheduler");
        run.shutdown.shutdown();

        let pool = &self.inner.pool;
        let permits = self.inner.pool_permits;
        let drained = tokio::time::timeout(timeout, async move {
            if let Err(e) = run.poll_handle.await {
                error!(error = %e, "Poll loop ended abnormally");
            }
            // Every permit back means every batch task finished
            let _all = pool.acquire_many(permits).await;
        })
        .await;

        match drained {
            Ok(()) => {
                info!(instance_id = %self.inner.instance_id, "Batch scheduler stopped");
                Ok(())
            }
            Err(_) => {
                let waited_ms = timeout.as_millis() as u64;
                warn!(
                    waited_ms = waited_ms,
                    workers_active = self.workers_active(),
                    "Batch scheduler stop timed out with batches in flight"
                );
                Err(AppError::ShutdownTimeout { waited_ms })
            }
        }
    }

    /// Submit a batch at the configured default priority
    ///
    /// `None` for `max_retries` takes the configured default.
    pub async fn submit_batch(
        &self,
        org_id: &str,
        workspace_id: &str,
        activity_ids: &[String],
        max_retries: Option<i64>,
    ) -> Result<BatchId> {
        self.submit(SubmitBatchRequest {
            org_id: org_id.to_string(),
            workspace_id: workspace_id.to_string(),
            activity_ids: activity_ids.to_vec(),
            max_retries,
            priority: self.inner.config.default_priority,
        })
        .await
    }

    /// Create a pending batch and one ref per activity
    ///
    /// The batch and its refs are written as one store call, so no poll sees
    /// the batch before its refs. Ref writes are best-effort inside that call:
    /// a failed ref is logged and the worker later counts it as an error.
    ///
    /// # Errors
    /// - AppError::NotRunning if the scheduler is stopped
    /// - AppError::Validation for empty input or duplicate activity IDs
    pub async fn submit(&self, request: SubmitBatchRequest) -> Result<BatchId> {
        if !self.is_running() {
            return Err(AppError::NotRunning);
        }
        validate_request(&request)?;

        let inner = &self.inner;
        let now = inner.time_provider.now_millis();
        let max_retries = request
            .max_retries
            .unwrap_or(inner.config.default_max_retries);
        let mut batch = BatchJob::new(
            inner.id_provider.generate_batch_id(),
            now,
            request.org_id,
            request.workspace_id,
            request.activity_ids.len() as i64,
            max_retries,
        );
        batch.priority = request.priority;

        let write = inner
            .store
            .create_batch_with_refs(&batch, &request.activity_ids);
        let failed_refs = bounded(inner.config.store_timeout, "create_batch_with_refs", write).await?;

        for failure in &failed_refs {
            warn!(
                batch_id = %batch.id,
                activity_id = %failure.activity_id,
                error = %failure.error,
                "Failed to add activity ref"
            );
        }

        info!(
            batch_id = %batch.id,
            org_id = %batch.org_id,
            activity_count = batch.activity_count,
            failed_refs = failed_refs.len(),
            max_retries = batch.max_retries,
            priority = batch.priority,
            "Batch submitted"
        );
        Ok(batch.id)
    }

    /// Run one poll cycle now, outside the timer
    ///
    /// # Returns
    /// Number of batches dispatched
    pub async fn poll_now(&self) -> Result<usize> {
        let mut token = {
            let run = self.inner.run.lock().unwrap_or_else(PoisonError::into_inner);
            match run.as_ref() {
                Some(run) => run.shutdown.token(),
                None => return Err(AppError::NotRunning),
            }
        };
        self.inner.poll_once(&mut token).await
    }

    pub fn get_stats(&self) -> SchedulerStats {
        self.inner.stats.snapshot(self.workers_active())
    }

    pub fn health_check(&self) -> HealthStatus {
        HealthStatus::from_stats(
            &self.get_stats(),
            self.is_running(),
            self.inner.time_provider.now_millis(),
        )
    }

    /// Pool size minus free permits
    pub fn workers_active(&self) -> usize {
        self.inner
            .config
            .worker_pool_size
            .saturating_sub(self.inner.pool.available_permits())
    }
}

fn validate_request(request: &SubmitBatchRequest) -> Result<()> {
    if request.activity_ids.is_empty() {
        return Err(AppError::Validation("activity_ids must not be empty".to_string()));
    }
    if request.org_id.trim().is_empty() {
        return Err(AppError::Validation("org_id must not be empty".to_string()));
    }
    if request.max_retries.is_some_and(|n| n < 0) {
        return Err(AppError::Validation(
            "max_retries must not be negative".to_string(),
        ));
    }
    let mut seen = HashSet::with_capacity(request.activity_ids.len());
    for id in &request.activity_ids {
        if id.is_empty() {
            return Err(AppError::Validation("activity id must not be empty".to_string()));
        }
        if !seen.insert(id.as_str()) {
            return Err(AppError::Validation(format!("duplicate activity id: {}", id)));
        }
    }
    Ok(())
}

impl Inner {
    fn next_worker_id(&self) -> String {
        let seq = self.worker_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-w{}", self.instance_id, seq)
    }

    /// Poll interval plus uniform jitter in `[0, jitter_range]`
    fn next_delay(&self) -> Duration {
        let jitter_ms = self.config.jitter_range.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.polling_interval + Duration::from_millis(jitter)
    }

    /// Requeue, fetch pending batches and dispatch them into the pool
    async fn poll_once(self: &Arc<Self>, shutdown: &mut ShutdownToken) -> Result<usize> {
        if self.config.auto_retry {
            self.requeue_retryable().await;
        }

        let batches = bounded(
            self.config.store_timeout,
            "get_pending_batches",
            self.store.get_pending_batches(self.config.max_batches_per_poll),
        )
        .await?;

        let found = batches.len();
        let mut dispatched = 0;
        for batch in batches {
            let permit = tokio::select! {
                permit = Arc::clone(&self.pool).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.wait() => break,
            };

            debug!(batch_id = %batch.id, priority = batch.priority, "Dispatching batch");
            let inner = Arc::clone(self);
            let token = shutdown.clone();
            tokio::spawn(async move {
                let _permit = permit;
                worker::run_batch(inner, batch, token).await;
            });
            dispatched += 1;
        }

        debug!(found = found, dispatched = dispatched, "Poll cycle finished");
        Ok(found)
    }

    async fn requeue_retryable(&self) {
        let retryable = bounded(
            self.config.store_timeout,
            "get_retryable_batches",
            self.store.get_retryable_batches(self.config.max_batches_per_poll),
        )
        .await;

        let batches = match retryable {
            Ok(batches) => batches,
            Err(e) => {
                warn!(error = %e, "Failed to fetch retryable batches");
                return;
            }
        };

        let mut requeued = 0;
        for batch in batches {
            let RetryDecision::Retry { attempt } = self.retry_policy.should_retry(&batch) else {
                continue;
            };
            let write = self.store.requeue_batch(&batch.id);
            match bounded(self.config.store_timeout, "requeue_batch", write).await {
                Ok(true) => {
                    requeued += 1;
                    warn!(batch_id = %batch.id, attempt = attempt, "Retrying failed batch");
                }
                Ok(false) => {}
                Err(e) => warn!(batch_id = %batch.id, error = %e, "Failed to requeue batch"),
            }
        }
        if requeued > 0 {
            self.stats.record_retried(requeued);
        }
    }
}

/// Polls immediately, then every interval plus jitter until shutdown
async fn poll_loop(inner: Arc<Inner>, mut shutdown: ShutdownToken) {
    debug!(instance_id = %inner.instance_id, "Poll loop started");

    loop {
        if shutdown.is_shutdown() {
            break;
        }

        let polled_at = inner.time_provider.now_millis();
        let result = inner.poll_once(&mut shutdown).await;

        let delay = inner.next_delay();
        let next_at = inner.time_provider.now_millis() + delay.as_millis() as i64;
        match result {
            Ok(found) => inner.stats.record_poll(polled_at, next_at, found),
            Err(e) => {
                error!(error = %e, "Poll cycle failed");
                inner.stats.record_poll_failure(polled_at, next_at);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait() => break,
        }
    }

    debug!(instance_id = %inner.instance_id, "Poll loop stopped");
}
