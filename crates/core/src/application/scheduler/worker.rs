// Per-batch worker: lock, process activities, write the outcome, release

use super::panic_guard::{execute_guarded_async, PanicGuardResult};
use super::stats::BatchTally;
use super::{Inner, ShutdownToken};
use crate::domain::{ActivityStatus, BatchJob, BatchProgress, JobStatus};
use crate::error::{AppError, Result};
use crate::port::{ActivityContext, ActivityProcessor, BatchStore, ProcessingError};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// How processing a locked batch ended
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BatchOutcome {
    /// Every activity accounted for
    Completed(BatchProgress),
    /// Batch-level failure
    Failed {
        message: String,
        progress: Option<BatchProgress>,
    },
    /// Status could not be moved to processing (cancelled meanwhile, store error)
    Skipped,
    /// Shutdown mid-batch; left in processing for the next lease holder
    Interrupted,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    success: i64,
    error: i64,
    emissions: f64,
}

impl Tally {
    fn progress(&self) -> BatchProgress {
        BatchProgress {
            success_count: self.success,
            error_count: self.error,
            total_emissions: self.emissions,
        }
    }
}

/// Result of one activity as seen by the batch loop
#[derive(Debug)]
enum Step {
    Succeeded(f64),
    Failed,
    /// Not started or abandoned because of shutdown
    Stopped,
    DeadlineExceeded,
    /// Outcome computed but not persisted
    WriteFailed(String),
}

struct ActivityTask {
    store: Arc<dyn BatchStore>,
    processor: Arc<dyn ActivityProcessor>,
    ctx: ActivityContext,
    deadline: Instant,
}

impl ActivityTask {
    async fn run(self) -> Step {
        if self.ctx.shutdown.is_shutdown() {
            return Step::Stopped;
        }
        if Instant::now() >= self.deadline {
            return Step::DeadlineExceeded;
        }

        let result = match timeout_at(self.deadline, self.processor.process(&self.ctx)).await {
            Ok(result) => result.and_then(|record| {
                record
                    .validate()
                    .map(|_| record)
                    .map_err(|e| ProcessingError::InvalidInput(e.to_string()))
            }),
            Err(_) => return Step::DeadlineExceeded,
        };

        let batch_id = &self.ctx.batch_id;
        let activity_id = &self.ctx.activity_id;

        match result {
            Ok(record) => {
                let write = self
                    .store
                    .mark_activity_complete(batch_id, activity_id, &record);
                match timeout_at(self.deadline, write).await {
                    Ok(Ok(())) => Step::Succeeded(record.emissions),
                    Ok(Err(e)) => Step::WriteFailed(e.to_string()),
                    Err(_) => Step::DeadlineExceeded,
                }
            }
            Err(ProcessingError::Cancelled) if self.ctx.shutdown.is_shutdown() => Step::Stopped,
            Err(e) => {
                debug!(
                    batch_id = %batch_id,
                    activity_id = %activity_id,
                    error = %e,
                    "Activity failed"
                );
                let reason = e.to_string();
                let write = self
                    .store
                    .mark_activity_failed(batch_id, activity_id, &reason);
                match timeout_at(self.deadline, write).await {
                    Ok(Ok(())) => Step::Failed,
                    Ok(Err(e)) => Step::WriteFailed(e.to_string()),
                    Err(_) => Step::DeadlineExceeded,
                }
            }
        }
    }
}

/// Bound a store call by `limit`, mapping expiry to StoreTimeout
pub(crate) async fn bounded<T>(
    limit: std::time::Duration,
    op: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    timeout(limit, fut)
        .await
        .map_err(|_| AppError::StoreTimeout(op.to_string()))?
}

/// Entry point of a dispatched batch task. Holds the pool permit for its whole run.
pub(crate) async fn run_batch(inner: Arc<Inner>, batch: BatchJob, mut shutdown: ShutdownToken) {
    let worker_id = inner.next_worker_id();
    let started = Instant::now();
    let deadline = started + inner.config.batch_timeout;
    let lock_deadline = deadline.min(started + inner.config.store_timeout);

    let acquire = inner
        .store
        .acquire_batch_lock(&batch.id, &worker_id, inner.config.batch_lease());

    let acquired = tokio::select! {
        res = timeout_at(lock_deadline, acquire) => match res {
            Ok(Ok(acquired)) => acquired,
            Ok(Err(e)) => {
                error!(batch_id = %batch.id, worker_id = %worker_id, error = %e, "Lock acquisition failed");
                return;
            }
            Err(_) => {
                warn!(batch_id = %batch.id, worker_id = %worker_id, "Lock acquisition timed out");
                return;
            }
        },
        _ = shutdown.wait() => {
            debug!(batch_id = %batch.id, "Shutdown before lock acquisition");
            return;
        }
    };

    if !acquired {
        debug!(batch_id = %batch.id, worker_id = %worker_id, "Batch locked by another worker");
        inner.stats.record_lock_contention();
        return;
    }

    debug!(batch_id = %batch.id, worker_id = %worker_id, "Batch lock acquired");

    let batch_id = batch.id.clone();
    let guarded = execute_guarded_async(process_locked(
        Arc::clone(&inner),
        batch,
        deadline,
        shutdown.clone(),
    ))
    .await;

    let outcome = match guarded {
        PanicGuardResult::Success(outcome) => outcome,
        PanicGuardResult::Panicked(msg) => BatchOutcome::Failed {
            message: format!("batch processing panicked: {}", msg),
            progress: None,
        },
        PanicGuardResult::Cancelled => BatchOutcome::Interrupted,
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    finish(&inner, &batch_id, &worker_id, outcome, elapsed_ms).await;
    release_lock(&inner, &batch_id, &worker_id).await;
}

/// Persist the outcome and update the counters
async fn finish(inner: &Inner, batch_id: &str, worker_id: &str, outcome: BatchOutcome, elapsed_ms: u64) {
    let store_timeout = inner.config.store_timeout;

    match outcome {
        BatchOutcome::Completed(progress) => {
            let write = inner
                .store
                .update_batch_status(batch_id, JobStatus::Complete, Some(&progress));
            match bounded(store_timeout, "update_batch_status", write).await {
                Ok(()) => {
                    info!(
                        batch_id = %batch_id,
                        worker_id = %worker_id,
                        success = progress.success_count,
                        errors = progress.error_count,
                        total_emissions = progress.total_emissions,
                        elapsed_ms = elapsed_ms,
                        "Batch completed"
                    );
                    inner.stats.record_batch(BatchTally::Completed {
                        successful: progress.success_count as u64,
                        failed: progress.error_count as u64,
                        emissions: progress.total_emissions,
                        elapsed_ms,
                    });
                }
                Err(e) => {
                    error!(batch_id = %batch_id, error = %e, "Failed to record batch completion");
                }
            }
        }
        BatchOutcome::Failed { message, progress } => {
            error!(batch_id = %batch_id, worker_id = %worker_id, error = %message, "Batch failed");
            let write = inner
                .store
                .mark_batch_failed(batch_id, &message, progress.as_ref());
            if let Err(e) = bounded(store_timeout, "mark_batch_failed", write).await {
                error!(batch_id = %batch_id, error = %e, "Failed to record batch failure");
            }
            inner.stats.record_batch(BatchTally::Failed { elapsed_ms });
        }
        BatchOutcome::Interrupted => {
            info!(
                batch_id = %batch_id,
                worker_id = %worker_id,
                "Batch interrupted by shutdown, left for reclaim"
            );
        }
        BatchOutcome::Skipped => {}
    }
}

/// Release runs on every exit path after a successful acquire
async fn release_lock(inner: &Inner, batch_id: &str, worker_id: &str) {
    let store = &inner.store;
    let store_timeout = inner.config.store_timeout;

    let released = inner
        .config
        .lock_release_backoff
        .retry("release_batch_lock", || {
            bounded(store_timeout, "release_batch_lock", store.release_batch_lock(batch_id))
        })
        .await;

    match released {
        Ok(()) => debug!(batch_id = %batch_id, worker_id = %worker_id, "Batch lock released"),
        Err(e) => error!(
            batch_id = %batch_id,
            worker_id = %worker_id,
            error = %e,
            "Failed to release batch lock, it will expire on its own"
        ),
    }
}

/// Process a batch whose lock this worker holds
async fn process_locked(
    inner: Arc<Inner>,
    batch: BatchJob,
    deadline: Instant,
    shutdown: ShutdownToken,
) -> BatchOutcome {
    let store = &inner.store;
    let timeout_message = format!(
        "batch processing exceeded timeout of {:?}",
        inner.config.batch_timeout
    );

    match timeout_at(
        deadline,
        store.update_batch_status(&batch.id, JobStatus::Processing, None),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(AppError::InvalidState(reason))) => {
            debug!(batch_id = %batch.id, reason = %reason, "Batch no longer processable");
            return BatchOutcome::Skipped;
        }
        Ok(Err(e)) => {
            error!(batch_id = %batch.id, error = %e, "Failed to mark batch processing");
            return BatchOutcome::Skipped;
        }
        Err(_) => {
            warn!(batch_id = %batch.id, "Timed out marking batch processing");
            return BatchOutcome::Skipped;
        }
    }

    let refs = match timeout_at(deadline, store.get_activity_refs(&batch.id)).await {
        Ok(Ok(refs)) => refs,
        Ok(Err(e)) => {
            return BatchOutcome::Failed {
                message: format!("failed to load activity refs: {}", e),
                progress: None,
            }
        }
        Err(_) => {
            return BatchOutcome::Failed {
                message: timeout_message,
                progress: None,
            }
        }
    };

    // Refs finished by an earlier lease holder count as-is
    let mut tally = Tally::default();
    let mut pending = Vec::new();
    for activity in &refs {
        match activity.status {
            ActivityStatus::Complete => {
                tally.success += 1;
                tally.emissions += activity.emissions.unwrap_or(0.0);
            }
            ActivityStatus::Failed => tally.error += 1,
            ActivityStatus::Pending => pending.push(activity.activity_id.clone()),
        }
    }

    if tally.success + tally.error > 0 {
        info!(
            batch_id = %batch.id,
            already_finished = tally.success + tally.error,
            remaining = pending.len(),
            "Resuming reclaimed batch"
        );
    }

    let deadline_millis =
        inner.time_provider.now_millis() + deadline.saturating_duration_since(Instant::now()).as_millis() as i64;

    let tasks = pending.into_iter().map(|activity_id| ActivityTask {
        store: Arc::clone(&inner.store),
        processor: Arc::clone(&inner.processor),
        ctx: ActivityContext {
            batch_id: batch.id.clone(),
            org_id: batch.org_id.clone(),
            workspace_id: batch.workspace_id.clone(),
            activity_id,
            deadline_millis,
            shutdown: shutdown.clone(),
        },
        deadline,
    });

    let mut steps = stream::iter(tasks)
        .map(ActivityTask::run)
        .buffer_unordered(inner.config.activity_concurrency);

    let mut timed_out = false;
    let mut stopped = false;
    let mut write_error = None;

    while let Some(step) = steps.next().await {
        match step {
            Step::Succeeded(emissions) => {
                tally.success += 1;
                tally.emissions += emissions;
            }
            Step::Failed => tally.error += 1,
            Step::Stopped => stopped = true,
            Step::DeadlineExceeded => timed_out = true,
            Step::WriteFailed(e) => {
                error!(batch_id = %batch.id, error = %e, "Failed to record activity outcome");
                write_error.get_or_insert(e);
            }
        }
    }

    if timed_out {
        warn!(batch_id = %batch.id, processed = tally.success + tally.error, "Batch deadline exceeded");
        return BatchOutcome::Failed {
            message: timeout_message,
            progress: Some(tally.progress()),
        };
    }

    if let Some(e) = write_error {
        return BatchOutcome::Failed {
            message: format!("failed to record activity outcome: {}", e),
            progress: Some(tally.progress()),
        };
    }

    if stopped {
        return BatchOutcome::Interrupted;
    }

    // Refs that failed to write at submission cannot be processed
    let untracked = batch.activity_count - refs.len() as i64;
    if untracked > 0 {
        warn!(
            batch_id = %batch.id,
            untracked = untracked,
            "Batch has activities without refs, counting them as errors"
        );
        tally.error += untracked;
    }

    BatchOutcome::Completed(tally.progress())
}
