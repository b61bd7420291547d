// In-memory BatchStore
// Full implementation of the store contract behind a single async mutex.
// Used by tests and by the daemon's `memory` backend.

use crate::domain::{
    ActivityRecord, ActivityRef, ActivityStatus, BatchId, BatchJob, BatchProgress,
    BatchProgressLog, JobStatus, ProgressEvent,
};
use crate::error::{AppError, Result};
use crate::port::batch_store::{BatchFilter, BatchStore, RefWriteFailure};
use crate::port::maintenance::{Maintenance, MaintenanceStats};
use crate::port::time_provider::{SystemTimeProvider, TimeProvider};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Default)]
struct State {
    batches: HashMap<BatchId, BatchJob>,
    refs: HashMap<BatchId, Vec<ActivityRef>>,
    log: HashMap<BatchId, Vec<BatchProgressLog>>,
    next_log_id: i64,
}

impl State {
    fn batch_mut(&mut self, batch_id: &str) -> Result<&mut BatchJob> {
        self.batches
            .get_mut(batch_id)
            .ok_or_else(|| AppError::NotFound(format!("batch {}", batch_id)))
    }

    fn add_ref(&mut self, batch_id: &str, activity_id: &str, now: i64) -> Result<()> {
        self.batch_mut(batch_id)?;

        let refs = self.refs.entry(batch_id.to_string()).or_default();
        if refs.iter().any(|r| r.activity_id == activity_id) {
            return Err(AppError::Conflict(format!(
                "activity {} already tracked by batch {}",
                activity_id, batch_id
            )));
        }
        refs.push(ActivityRef::new(batch_id, activity_id, now));
        Ok(())
    }

    fn append_log(&mut self, batch: &BatchJob, event: ProgressEvent, now: i64) {
        self.next_log_id += 1;
        let mut entry = BatchProgressLog::snapshot(batch, event, now);
        entry.id = self.next_log_id;
        self.log.entry(batch.id.clone()).or_default().push(entry);
    }
}

pub struct InMemoryBatchStore {
    state: Mutex<State>,
    time_provider: Arc<dyn TimeProvider>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::with_time_provider(Arc::new(SystemTimeProvider))
    }

    pub fn with_time_provider(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            time_provider,
        }
    }
}

impl Default for InMemoryBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_transition(batch: &BatchJob, next: JobStatus) -> AppError {
    AppError::InvalidState(format!(
        "batch {} cannot move from {} to {}",
        batch.id, batch.status, next
    ))
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn create_batch(&self, batch: &BatchJob) -> Result<BatchId> {
        let now = self.time_provider.now_millis();
        let mut state = self.state.lock().await;
        if state.batches.contains_key(&batch.id) {
            return Err(AppError::Conflict(format!("batch {} already exists", batch.id)));
        }
        state.append_log(batch, ProgressEvent::Created, now);
        state.batches.insert(batch.id.clone(), batch.clone());
        Ok(batch.id.clone())
    }

    async fn add_activity_ref(&self, batch_id: &str, activity_id: &str) -> Result<()> {
        let now = self.time_provider.now_millis();
        self.state.lock().await.add_ref(batch_id, activity_id, now)
    }

    async fn create_batch_with_refs(
        &self,
        batch: &BatchJob,
        activity_ids: &[String],
    ) -> Result<Vec<RefWriteFailure>> {
        let now = self.time_provider.now_millis();
        // One guard for the batch and its refs: pollers wait on the same mutex
        let mut state = self.state.lock().await;
        if state.batches.contains_key(&batch.id) {
            return Err(AppError::Conflict(format!("batch {} already exists", batch.id)));
        }
        state.append_log(batch, ProgressEvent::Created, now);
        state.batches.insert(batch.id.clone(), batch.clone());

        let mut failures = Vec::new();
        for activity_id in activity_ids {
            if let Err(e) = state.add_ref(&batch.id, activity_id, now) {
                failures.push(RefWriteFailure {
                    activity_id: activity_id.clone(),
                    error: e.to_string(),
                });
            }
        }
        Ok(failures)
    }

    async fn get_pending_batches(&self, limit: usize) -> Result<Vec<BatchJob>> {
        let now = self.time_provider.now_millis();
        let state = self.state.lock().await;

        let mut pending: Vec<BatchJob> = state
            .batches
            .values()
            .filter(|b| !b.status.is_terminal() && !b.is_locked(now))
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn acquire_batch_lock(
        &self,
        batch_id: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let now = self.time_provider.now_millis();
        let until = now.saturating_add(timeout.as_millis() as i64);
        let mut state = self.state.lock().await;
        let batch = state.batch_mut(batch_id)?;
        Ok(batch.try_lock(worker_id, until, now))
    }

    async fn release_batch_lock(&self, batch_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(batch) = state.batches.get_mut(batch_id) {
            batch.unlock();
        }
        Ok(())
    }

    async fn update_batch_status(
        &self,
        batch_id: &str,
        status: JobStatus,
        progress: Option<&BatchProgress>,
    ) -> Result<()> {
        let now = self.time_provider.now_millis();
        let mut state = self.state.lock().await;
        let current = state.batch_mut(batch_id)?;
        if !current.status.can_transition_to(status) {
            return Err(invalid_transition(current, status));
        }

        let mut next = current.clone();
        if let Some(progress) = progress {
            next.apply_progress(progress, now)?;
        }
        next.transition_to(status, now)?;

        *current = next.clone();
        state.append_log(&next, ProgressEvent::for_status(status), now);
        Ok(())
    }

    async fn mark_activity_complete(
        &self,
        batch_id: &str,
        activity_id: &str,
        record: &ActivityRecord,
    ) -> Result<()> {
        record.validate()?;
        let now = self.time_provider.now_millis();
        let mut state = self.state.lock().await;

        let mut batch = state.batch_mut(batch_id)?.clone();
        batch.record_activity_success(record.emissions, now)?;

        let activity = pending_ref(&mut state, batch_id, activity_id)?;
        activity.status = ActivityStatus::Complete;
        activity.emissions = Some(record.emissions);
        activity.metadata = record.metadata.clone();
        activity.updated_at = now;

        state.batches.insert(batch_id.to_string(), batch);
        Ok(())
    }

    async fn mark_activity_failed(
        &self,
        batch_id: &str,
        activity_id: &str,
        reason: &str,
    ) -> Result<()> {
        let now = self.time_provider.now_millis();
        let mut state = self.state.lock().await;

        let mut batch = state.batch_mut(batch_id)?.clone();
        batch.record_activity_failure(now)?;

        let activity = pending_ref(&mut state, batch_id, activity_id)?;
        activity.status = ActivityStatus::Failed;
        activity.error_message = Some(reason.to_string());
        activity.updated_at = now;

        state.batches.insert(batch_id.to_string(), batch);
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchJob>> {
        let state = self.state.lock().await;
        Ok(state.batches.get(batch_id).cloned())
    }

    async fn list_batches(&self, org_id: &str, filter: &BatchFilter) -> Result<Vec<BatchJob>> {
        let state = self.state.lock().await;
        let mut batches: Vec<BatchJob> = state
            .batches
            .values()
            .filter(|b| b.org_id == org_id)
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .cloned()
            .collect();
        batches.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(batches
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn get_activity_refs(&self, batch_id: &str) -> Result<Vec<ActivityRef>> {
        let state = self.state.lock().await;
        Ok(state.refs.get(batch_id).cloned().unwrap_or_default())
    }

    async fn mark_batch_failed(
        &self,
        batch_id: &str,
        error_message: &str,
        progress: Option<&BatchProgress>,
    ) -> Result<()> {
        let now = self.time_provider.now_millis();
        let mut state = self.state.lock().await;
        let current = state.batch_mut(batch_id)?;
        if !current.status.can_transition_to(JobStatus::Failed) {
            return Err(invalid_transition(current, JobStatus::Failed));
        }

        let mut next = current.clone();
        if let Some(progress) = progress {
            next.apply_progress(progress, now)?;
        }
        next.fail(error_message, now)?;

        *current = next.clone();
        state.append_log(&next, ProgressEvent::Failed, now);
        Ok(())
    }

    async fn requeue_batch(&self, batch_id: &str) -> Result<bool> {
        let now = self.time_provider.now_millis();
        let mut state = self.state.lock().await;
        let batch = state.batch_mut(batch_id)?;
        if !batch.can_retry() {
            return Ok(false);
        }
        batch.prepare_retry(now)?;
        let snapshot = batch.clone();

        if let Some(refs) = state.refs.get_mut(batch_id) {
            for activity in refs.iter_mut() {
                activity.status = ActivityStatus::Pending;
                activity.error_message = None;
                activity.emissions = None;
                activity.metadata = None;
                activity.updated_at = now;
            }
        }
        state.append_log(&snapshot, ProgressEvent::Requeued, now);
        Ok(true)
    }

    async fn get_retryable_batches(&self, limit: usize) -> Result<Vec<BatchJob>> {
        let state = self.state.lock().await;
        let mut retryable: Vec<BatchJob> = state
            .batches
            .values()
            .filter(|b| b.can_retry())
            .cloned()
            .collect();
        retryable.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        retryable.truncate(limit);
        Ok(retryable)
    }

    async fn delete_batch(&self, batch_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let existed = state.batches.remove(batch_id).is_some();
        state.refs.remove(batch_id);
        state.log.remove(batch_id);
        Ok(existed)
    }

    async fn get_progress_log(&self, batch_id: &str) -> Result<Vec<BatchProgressLog>> {
        let state = self.state.lock().await;
        Ok(state.log.get(batch_id).cloned().unwrap_or_default())
    }
}

fn pending_ref<'a>(
    state: &'a mut State,
    batch_id: &str,
    activity_id: &str,
) -> Result<&'a mut ActivityRef> {
    let activity = state
        .refs
        .get_mut(batch_id)
        .and_then(|refs| refs.iter_mut().find(|r| r.activity_id == activity_id))
        .ok_or_else(|| {
            AppError::NotFound(format!("activity {} in batch {}", activity_id, batch_id))
        })?;
    if activity.status != ActivityStatus::Pending {
        return Err(AppError::Conflict(format!(
            "activity {} already {}",
            activity_id, activity.status
        )));
    }
    Ok(activity)
}

#[async_trait]
impl Maintenance for InMemoryBatchStore {
    async fn vacuum(&self) -> Result<f64> {
        Ok(0.0)
    }

    async fn gc_finished_batches(&self, retention_days: i64) -> Result<i64> {
        let cutoff = self.time_provider.now_millis() - retention_days * MILLIS_PER_DAY;
        let mut state = self.state.lock().await;

        let expired: Vec<BatchId> = state
            .batches
            .values()
            .filter(|b| b.status.is_terminal())
            .filter(|b| b.completed_at.unwrap_or(b.updated_at) < cutoff)
            .map(|b| b.id.clone())
            .collect();

        for id in &expired {
            state.batches.remove(id);
            state.refs.remove(id);
            state.log.remove(id);
        }
        Ok(expired.len() as i64)
    }

    async fn get_stats(&self) -> Result<MaintenanceStats> {
        let state = self.state.lock().await;
        Ok(MaintenanceStats {
            db_size_mb: 0.0,
            db_size_bytes: 0,
            batch_count: state.batches.len() as i64,
            finished_batch_count: state
                .batches
                .values()
                .filter(|b| b.status.is_terminal())
                .count() as i64,
            activity_ref_count: state.refs.values().map(Vec::len).sum::<usize>() as i64,
            progress_log_count: state.log.values().map(Vec::len).sum::<usize>() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::time_provider::mocks::ManualTimeProvider;

    async fn seeded(activities: usize) -> (Arc<ManualTimeProvider>, InMemoryBatchStore, String) {
        let clock = Arc::new(ManualTimeProvider::new(1_000));
        let store = InMemoryBatchStore::with_time_provider(clock.clone());
        let batch = BatchJob::new("batch_a", 1_000, "org", "ws", activities as i64, 2);
        let id = store.create_batch(&batch).await.unwrap();
        for i in 0..activities {
            store.add_activity_ref(&id, &format!("act-{}", i)).await.unwrap();
        }
        (clock, store, id)
    }

    #[tokio::test]
    async fn test_lock_excludes_second_worker_until_expiry() {
        let (clock, store, id) = seeded(1).await;
        let timeout = Duration::from_millis(500);

        assert!(store.acquire_batch_lock(&id, "w1", timeout).await.unwrap());
        assert!(!store.acquire_batch_lock(&id, "w2", timeout).await.unwrap());
        assert!(store.get_pending_batches(10).await.unwrap().is_empty());

        clock.advance(500);
        assert!(store.acquire_batch_lock(&id, "w2", timeout).await.unwrap());
        let batch = store.get_batch(&id).await.unwrap().unwrap();
        assert_eq!(batch.locked_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_lock_missing_batch_is_not_found() {
        let store = InMemoryBatchStore::new();
        let err = store
            .acquire_batch_lock("nope", "w1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_pending_order_priority_then_age() {
        let store = InMemoryBatchStore::new();
        let mut low_old = BatchJob::new("b_low_old", 1, "org", "ws", 1, 0);
        low_old.priority = 1;
        let mut high_new = BatchJob::new("b_high_new", 3, "org", "ws", 1, 0);
        high_new.priority = 9;
        let mut high_old = BatchJob::new("b_high_old", 2, "org", "ws", 1, 0);
        high_old.priority = 9;
        let mut done = BatchJob::new("b_done", 0, "org", "ws", 1, 0);
        done.status = JobStatus::Complete;

        for b in [&low_old, &high_new, &high_old, &done] {
            store.create_batch(b).await.unwrap();
        }

        let ids: Vec<String> = store
            .get_pending_batches(10)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec!["b_high_old", "b_high_new", "b_low_old"]);
        assert_eq!(store.get_pending_batches(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_activity_outcomes_update_counts_once() {
        let (_clock, store, id) = seeded(2).await;
        store
            .update_batch_status(&id, JobStatus::Processing, None)
            .await
            .unwrap();

        store
            .mark_activity_complete(&id, "act-0", &ActivityRecord::new(4.5))
            .await
            .unwrap();
        store.mark_activity_failed(&id, "act-1", "bad meter").await.unwrap();

        let again = store
            .mark_activity_complete(&id, "act-0", &ActivityRecord::new(1.0))
            .await;
        assert!(matches!(again, Err(AppError::Conflict(_))));

        let batch = store.get_batch(&id).await.unwrap().unwrap();
        assert_eq!((batch.success_count, batch.error_count), (1, 1));
        assert_eq!(batch.total_emissions, 4.5);

        let refs = store.get_activity_refs(&id).await.unwrap();
        assert_eq!(refs[0].emissions, Some(4.5));
        assert_eq!(refs[1].error_message.as_deref(), Some("bad meter"));
    }

    #[tokio::test]
    async fn test_negative_emissions_rejected() {
        let (_clock, store, id) = seeded(1).await;
        let result = store
            .mark_activity_complete(&id, "act-0", &ActivityRecord::new(-2.0))
            .await;
        assert!(result.is_err());
        let refs = store.get_activity_refs(&id).await.unwrap();
        assert_eq!(refs[0].status, ActivityStatus::Pending);
    }

    #[tokio::test]
    async fn test_status_writes_follow_state_machine() {
        let (_clock, store, id) = seeded(1).await;

        let err = store
            .update_batch_status(&id, JobStatus::Complete, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        store
            .update_batch_status(&id, JobStatus::Processing, None)
            .await
            .unwrap();
        let progress = BatchProgress {
            success_count: 1,
            error_count: 0,
            total_emissions: 3.0,
        };
        store
            .update_batch_status(&id, JobStatus::Complete, Some(&progress))
            .await
            .unwrap();

        let events: Vec<ProgressEvent> = store
            .get_progress_log(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            events,
            vec![ProgressEvent::Created, ProgressEvent::Started, ProgressEvent::Completed]
        );
    }

    #[tokio::test]
    async fn test_progress_beyond_activity_count_rejected() {
        let (_clock, store, id) = seeded(1).await;
        store
            .update_batch_status(&id, JobStatus::Processing, None)
            .await
            .unwrap();
        let progress = BatchProgress {
            success_count: 2,
            error_count: 0,
            total_emissions: 0.0,
        };
        assert!(store
            .update_batch_status(&id, JobStatus::Complete, Some(&progress))
            .await
            .is_err());
        let batch = store.get_batch(&id).await.unwrap().unwrap();
        assert_eq!(batch.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_requeue_resets_batch_and_refs() {
        let (_clock, store, id) = seeded(2).await;
        store
            .update_batch_status(&id, JobStatus::Processing, None)
            .await
            .unwrap();
        store.mark_activity_failed(&id, "act-0", "boom").await.unwrap();
        store.mark_batch_failed(&id, "worker panicked", None).await.unwrap();

        assert_eq!(store.get_retryable_batches(10).await.unwrap().len(), 1);
        assert!(store.requeue_batch(&id).await.unwrap());

        let batch = store.get_batch(&id).await.unwrap().unwrap();
        assert_eq!(batch.status, JobStatus::Pending);
        assert_eq!(batch.retry_count, 1);
        assert_eq!(batch.error_count, 0);
        assert!(store
            .get_activity_refs(&id)
            .await
            .unwrap()
            .iter()
            .all(|r| r.status == ActivityStatus::Pending));

        // Not failed any more
        assert!(!store.requeue_batch(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_batches_newest_first() {
        let store = InMemoryBatchStore::new();
        for (id, at) in [("b1", 10), ("b2", 30), ("b3", 20)] {
            store
                .create_batch(&BatchJob::new(id, at, "org", "ws", 1, 0))
                .await
                .unwrap();
        }
        store
            .create_batch(&BatchJob::new("other", 40, "org2", "ws", 1, 0))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list_batches("org", &BatchFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec!["b2", "b3", "b1"]);

        let page = BatchFilter {
            limit: 1,
            offset: 1,
            ..BatchFilter::default()
        };
        assert_eq!(store.list_batches("org", &page).await.unwrap()[0].id, "b3");
    }

    #[tokio::test]
    async fn test_gc_removes_old_finished_batches() {
        let (clock, store, id) = seeded(1).await;
        store.update_batch_status(&id, JobStatus::Cancelled, None).await.unwrap();
        store
            .create_batch(&BatchJob::new("batch_live", 1_000, "org", "ws", 1, 0))
            .await
            .unwrap();

        assert_eq!(store.gc_finished_batches(1).await.unwrap(), 0);
        clock.advance(2 * MILLIS_PER_DAY);
        assert_eq!(store.gc_finished_batches(1).await.unwrap(), 1);

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.batch_count, 1);
        assert_eq!(stats.activity_ref_count, 0);
    }

    #[tokio::test]
    async fn test_create_batch_with_refs_reports_failed_refs() {
        let store = InMemoryBatchStore::with_time_provider(Arc::new(ManualTimeProvider::new(1_000)));
        let batch = BatchJob::new("batch_a", 1_000, "org", "ws", 3, 2);
        let ids = vec!["a1".to_string(), "a2".to_string(), "a1".to_string()];

        let failures = store.create_batch_with_refs(&batch, &ids).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].activity_id, "a1");

        let refs = store.get_activity_refs("batch_a").await.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(store.get_pending_batches(10).await.unwrap().len(), 1);

        let log = store.get_progress_log("batch_a").await.unwrap();
        assert_eq!(log[0].event_type, ProgressEvent::Created);

        // Same id again creates nothing
        let err = store.create_batch_with_refs(&batch, &ids[..1]).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(store.get_activity_refs("batch_a").await.unwrap().len(), 2);
    }
}
