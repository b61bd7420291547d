// Batch Store Port (Interface)
// Durable batch/ref/progress-log state and the lock primitive

use crate::domain::{
    ActivityRecord, ActivityRef, BatchId, BatchJob, BatchProgress, BatchProgressLog, JobStatus,
};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Default page size for `list_batches`
pub const DEFAULT_LIST_LIMIT: usize = 10;

/// Largest page a caller may ask for
pub const MAX_LIST_LIMIT: usize = 1000;

/// Filter for `list_batches`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFilter {
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for BatchFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl BatchFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// A ref that could not be written by `create_batch_with_refs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefWriteFailure {
    pub activity_id: String,
    pub error: String,
}

/// Store interface consumed by the scheduler
///
/// Lock grants are decided here and nowhere else: `acquire_batch_lock` must be
/// a single atomic conditional write. Status writes are conditional on the
/// batch state machine and append a progress-log event in the same write.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Insert a new batch (status pending) and log `created`
    async fn create_batch(&self, batch: &BatchJob) -> Result<BatchId>;

    /// Track one activity of the batch (status pending)
    async fn add_activity_ref(&self, batch_id: &str, activity_id: &str) -> Result<()>;

    /// Insert a batch together with one pending ref per activity
    ///
    /// The batch becomes visible to `get_pending_batches` only with all of its
    /// refs. A ref that fails to write is reported back and does not abort
    /// the batch; an error means nothing was created.
    async fn create_batch_with_refs(
        &self,
        batch: &BatchJob,
        activity_ids: &[String],
    ) -> Result<Vec<RefWriteFailure>>;

    /// Unlocked, non-terminal batches ordered by priority DESC, created_at ASC
    async fn get_pending_batches(&self, limit: usize) -> Result<Vec<BatchJob>>;

    /// Claim the batch for `timeout` unless another worker holds an unexpired lock
    ///
    /// # Returns
    /// `false` on contention (not an error)
    ///
    /// # Errors
    /// - AppError::NotFound if the batch does not exist
    async fn acquire_batch_lock(
        &self,
        batch_id: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<bool>;

    /// Clear the lock unconditionally
    async fn release_batch_lock(&self, batch_id: &str) -> Result<()>;

    /// Transition the batch, optionally overwriting its counts
    ///
    /// # Errors
    /// - AppError::NotFound if the batch does not exist
    /// - AppError::InvalidState if the current status cannot reach `status`
    async fn update_batch_status(
        &self,
        batch_id: &str,
        status: JobStatus,
        progress: Option<&BatchProgress>,
    ) -> Result<()>;

    /// Flip a pending ref to complete and add its emissions to the batch
    async fn mark_activity_complete(
        &self,
        batch_id: &str,
        activity_id: &str,
        record: &ActivityRecord,
    ) -> Result<()>;

    /// Flip a pending ref to failed and count the error on the batch
    async fn mark_activity_failed(
        &self,
        batch_id: &str,
        activity_id: &str,
        reason: &str,
    ) -> Result<()>;

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchJob>>;

    /// Batches of one organization, newest first
    async fn list_batches(&self, org_id: &str, filter: &BatchFilter) -> Result<Vec<BatchJob>>;

    async fn get_activity_refs(&self, batch_id: &str) -> Result<Vec<ActivityRef>>;

    /// `processing -> failed` with an error message for pollers
    async fn mark_batch_failed(
        &self,
        batch_id: &str,
        error_message: &str,
        progress: Option<&BatchProgress>,
    ) -> Result<()>;

    /// Put a failed batch with remaining budget back to pending, resetting
    /// counts and every ref.
    ///
    /// # Returns
    /// `false` when the batch is not failed or its budget is spent
    async fn requeue_batch(&self, batch_id: &str) -> Result<bool>;

    /// Failed batches with `retry_count < max_retries`, oldest failure first
    async fn get_retryable_batches(&self, limit: usize) -> Result<Vec<BatchJob>>;

    /// Delete the batch with its refs and progress log
    ///
    /// # Returns
    /// `false` if there was nothing to delete
    async fn delete_batch(&self, batch_id: &str) -> Result<bool>;

    async fn get_progress_log(&self, batch_id: &str) -> Result<Vec<BatchProgressLog>>;
}

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Wraps a store and refuses to write refs for the given activities
    pub struct RefRejectingStore {
        inner: Arc<dyn BatchStore>,
        rejected: HashSet<String>,
    }

    impl RefRejectingStore {
        pub fn new<I, S>(inner: Arc<dyn BatchStore>, rejected: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                inner,
                rejected: rejected.into_iter().map(Into::into).collect(),
            }
        }

        fn rejection(&self, activity_id: &str) -> AppError {
            AppError::Database(format!("ref write rejected for {}", activity_id))
        }
    }

    #[async_trait]
    impl BatchStore for RefRejectingStore {
        async fn create_batch(&self, batch: &BatchJob) -> Result<BatchId> {
            self.inner.create_batch(batch).await
        }

        async fn add_activity_ref(&self, batch_id: &str, activity_id: &str) -> Result<()> {
            if self.rejected.contains(activity_id) {
                return Err(self.rejection(activity_id));
            }
            self.inner.add_activity_ref(batch_id, activity_id).await
        }

        async fn create_batch_with_refs(
            &self,
            batch: &BatchJob,
            activity_ids: &[String],
        ) -> Result<Vec<RefWriteFailure>> {
            let (rejected, accepted): (Vec<String>, Vec<String>) = activity_ids
                .iter()
                .cloned()
                .partition(|id| self.rejected.contains(id));

            let mut failures = self.inner.create_batch_with_refs(batch, &accepted).await?;
            failures.extend(rejected.into_iter().map(|activity_id| RefWriteFailure {
                error: self.rejection(&activity_id).to_string(),
                activity_id,
            }));
            Ok(failures)
        }

        async fn get_pending_batches(&self, limit: usize) -> Result<Vec<BatchJob>> {
            self.inner.get_pending_batches(limit).await
        }

        async fn acquire_batch_lock(
            &self,
            batch_id: &str,
            worker_id: &str,
            timeout: Duration,
        ) -> Result<bool> {
            self.inner.acquire_batch_lock(batch_id, worker_id, timeout).await
        }

        async fn release_batch_lock(&self, batch_id: &str) -> Result<()> {
            self.inner.release_batch_lock(batch_id).await
        }

        async fn update_batch_status(
            &self,
            batch_id: &str,
            status: JobStatus,
            progress: Option<&BatchProgress>,
        ) -> Result<()> {
            self.inner.update_batch_status(batch_id, status, progress).await
        }

        async fn mark_activity_complete(
            &self,
            batch_id: &str,
            activity_id: &str,
            record: &ActivityRecord,
        ) -> Result<()> {
            self.inner
                .mark_activity_complete(batch_id, activity_id, record)
                .await
        }

        async fn mark_activity_failed(
            &self,
            batch_id: &str,
            activity_id: &str,
            reason: &str,
        ) -> Result<()> {
            self.inner
                .mark_activity_failed(batch_id, activity_id, reason)
                .await
        }

        async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchJob>> {
            self.inner.get_batch(batch_id).await
        }

        async fn list_batches(&self, org_id: &str, filter: &BatchFilter) -> Result<Vec<BatchJob>> {
            self.inner.list_batches(org_id, filter).await
        }

        async fn get_activity_refs(&self, batch_id: &str) -> Result<Vec<ActivityRef>> {
            self.inner.get_activity_refs(batch_id).await
        }

        async fn mark_batch_failed(
            &self,
            batch_id: &str,
            error_message: &str,
            progress: Option<&BatchProgress>,
        ) -> Result<()> {
            self.inner
                .mark_batch_failed(batch_id, error_message, progress)
                .await
        }

        async fn requeue_batch(&self, batch_id: &str) -> Result<bool> {
            self.inner.requeue_batch(batch_id).await
        }

        async fn get_retryable_batches(&self, limit: usize) -> Result<Vec<BatchJob>> {
            self.inner.get_retryable_batches(limit).await
        }

        async fn delete_batch(&self, batch_id: &str) -> Result<bool> {
            self.inner.delete_batch(batch_id).await
        }

        async fn get_progress_log(&self, batch_id: &str) -> Result<Vec<BatchProgressLog>> {
            self.inner.get_progress_log(batch_id).await
        }
    }
}
