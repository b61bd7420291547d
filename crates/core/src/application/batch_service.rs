// Batch Service - management operations over stored batches
// (detail, listing, progress, cancel, retry, delete)

use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::domain::{BatchDetail, BatchJob, BatchProgressLog, JobStatus, ProgressReport};
use crate::error::{AppError, Result};
use crate::port::batch_store::{DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
use crate::port::{BatchFilter, BatchStore, TimeProvider};
use std::sync::Arc;
use tracing::info;

pub struct BatchService {
    store: Arc<dyn BatchStore>,
    time_provider: Arc<dyn TimeProvider>,
    retry_policy: RetryPolicy,
}

impl BatchService {
    pub fn new(store: Arc<dyn BatchStore>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            store,
            time_provider,
            retry_policy: RetryPolicy,
        }
    }

    async fn load(&self, batch_id: &str) -> Result<BatchJob> {
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("batch {}", batch_id)))
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<BatchDetail> {
        Ok(BatchDetail::from_batch(&self.load(batch_id).await?))
    }

    /// Newest first. A zero limit means the default page; larger pages are capped.
    pub async fn list_batches(&self, org_id: &str, filter: BatchFilter) -> Result<Vec<BatchDetail>> {
        let filter = BatchFilter {
            limit: match filter.limit {
                0 => DEFAULT_LIST_LIMIT,
                n => n.min(MAX_LIST_LIMIT),
            },
            ..filter
        };
        let batches = self.store.list_batches(org_id, &filter).await?;
        Ok(batches.iter().map(BatchDetail::from_batch).collect())
    }

    pub async fn get_progress(&self, batch_id: &str) -> Result<ProgressReport> {
        Ok(ProgressReport::from_batch(&self.load(batch_id).await?))
    }

    /// Only batches nobody has started yet
    ///
    /// # Errors
    /// - AppError::NotFound for an unknown batch
    /// - AppError::Conflict once processing started or the batch finished
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<BatchDetail> {
        let batch = self.load(batch_id).await?;
        if !matches!(batch.status, JobStatus::Pending | JobStatus::Queued) {
            return Err(AppError::Conflict(format!(
                "cannot cancel batch in status {}",
                batch.status
            )));
        }

        self.store
            .update_batch_status(batch_id, JobStatus::Cancelled, None)
            .await
            .map_err(|e| match e {
                // Picked up by a worker in between
                AppError::InvalidState(msg) => AppError::Conflict(msg),
                other => other,
            })?;

        info!(batch_id = %batch_id, "Batch cancelled");
        self.get_batch(batch_id).await
    }

    /// Requeue a failed batch with retry budget left
    ///
    /// # Errors
    /// - AppError::Conflict when the batch is not failed or its budget is spent
    pub async fn retry_batch(&self, batch_id: &str) -> Result<BatchDetail> {
        let batch = self.load(batch_id).await?;
        match self.retry_policy.should_retry(&batch) {
            RetryDecision::Retry { .. } => {}
            RetryDecision::Exhausted => {
                return Err(AppError::Conflict(format!(
                    "max retries ({}) reached",
                    batch.max_retries
                )))
            }
            RetryDecision::NotFailed => {
                return Err(AppError::Conflict(format!(
                    "can only retry failed batches, batch is {}",
                    batch.status
                )))
            }
        }

        if !self.store.requeue_batch(batch_id).await? {
            return Err(AppError::Conflict(format!(
                "batch {} changed while retrying",
                batch_id
            )));
        }

        let detail = self.get_batch(batch_id).await?;
        info!(batch_id = %batch_id, retry_count = detail.retry_count, "Batch retried");
        Ok(detail)
    }

    /// Delete a batch with its refs and progress log
    ///
    /// # Errors
    /// - AppError::Conflict while a worker holds the batch lock
    pub async fn delete_batch(&self, batch_id: &str) -> Result<()> {
        let batch = self.load(batch_id).await?;
        if batch.is_locked(self.time_provider.now_millis()) {
            return Err(AppError::Conflict(format!(
                "batch {} is being processed",
                batch_id
            )));
        }
        if !self.store.delete_batch(batch_id).await? {
            return Err(AppError::NotFound(format!("batch {}", batch_id)));
        }
        info!(batch_id = %batch_id, "Batch deleted");
        Ok(())
    }

    pub async fn get_progress_log(&self, batch_id: &str) -> Result<Vec<BatchProgressLog>> {
        self.load(batch_id).await?;
        self.store.get_progress_log(batch_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProgressEvent;
    use crate::port::time_provider::mocks::ManualTimeProvider;
    use crate::port::InMemoryBatchStore;
    use std::time::Duration;

    async fn setup() -> (Arc<InMemoryBatchStore>, BatchService) {
        let clock = Arc::new(ManualTimeProvider::new(10_000));
        let store = Arc::new(InMemoryBatchStore::with_time_provider(clock.clone()));
        let service = BatchService::new(store.clone(), clock);
        (store, service)
    }

    async fn create(store: &InMemoryBatchStore, id: &str, status: JobStatus) {
        let mut batch = BatchJob::new(id, 1_000, "org", "ws", 2, 1);
        batch.status = status;
        store.create_batch(&batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_unknown_batch_is_not_found() {
        let (_store, service) = setup().await;
        assert!(matches!(
            service.get_batch("missing").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_only() {
        let (store, service) = setup().await;
        create(&store, "b_pending", JobStatus::Pending).await;
        create(&store, "b_running", JobStatus::Processing).await;

        let detail = service.cancel_batch("b_pending").await.unwrap();
        assert_eq!(detail.status, JobStatus::Cancelled);

        assert!(matches!(
            service.cancel_batch("b_running").await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            service.cancel_batch("b_pending").await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_respects_budget() {
        let (store, service) = setup().await;
        create(&store, "b_failed", JobStatus::Failed).await;
        create(&store, "b_done", JobStatus::Complete).await;

        let detail = service.retry_batch("b_failed").await.unwrap();
        assert_eq!(detail.status, JobStatus::Pending);
        assert_eq!(detail.retry_count, 1);

        // Fail it again: budget of 1 is now spent
        store
            .update_batch_status("b_failed", JobStatus::Processing, None)
            .await
            .unwrap();
        store.mark_batch_failed("b_failed", "boom", None).await.unwrap();
        let err = service.retry_batch("b_failed").await.unwrap_err();
        assert!(err.to_string().contains("max retries"));

        assert!(matches!(
            service.retry_batch("b_done").await,
            Err(AppError::Conflict(_))
        ));

        let events: Vec<ProgressEvent> = service
            .get_progress_log("b_failed")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(events.contains(&ProgressEvent::Requeued));
    }

    #[tokio::test]
    async fn test_delete_refused_while_locked() {
        let (store, service) = setup().await;
        create(&store, "b1", JobStatus::Processing).await;
        store
            .acquire_batch_lock("b1", "w1", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(
            service.delete_batch("b1").await,
            Err(AppError::Conflict(_))
        ));

        store.release_batch_lock("b1").await.unwrap();
        service.delete_batch("b1").await.unwrap();
        assert!(matches!(
            service.get_batch("b1").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_clamps_limit() {
        let (store, service) = setup().await;
        for i in 0..12 {
            create(&store, &format!("b{:02}", i), JobStatus::Pending).await;
        }
        let filter = BatchFilter {
            limit: 0,
            ..BatchFilter::default()
        };
        assert_eq!(service.list_batches("org", filter).await.unwrap().len(), DEFAULT_LIST_LIMIT);

        let pending_only = BatchFilter::default().with_status(JobStatus::Complete);
        assert!(service.list_batches("org", pending_only).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_progress_of_pending_batch() {
        let (store, service) = setup().await;
        create(&store, "b1", JobStatus::Pending).await;
        let report = service.get_progress("b1").await.unwrap();
        assert_eq!(report.total_count, 2);
        assert_eq!(report.percent_complete, 0.0);
        assert!(report.estimated_remaining_ms.is_none());
    }
}
