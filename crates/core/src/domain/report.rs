// Read views derived from a BatchJob at query time

use crate::domain::batch::{BatchId, BatchJob, JobStatus, Priority};
use serde::{Deserialize, Serialize};

/// Batch as shown to callers polling its status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDetail {
    pub id: BatchId,
    pub org_id: String,
    pub workspace_id: String,
    pub status: JobStatus,
    pub activity_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub total_emissions: f64,
    pub progress_percent: f64,
    pub remaining_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub priority: Priority,
    pub created_at: i64,
    pub updated_at: i64,
    /// Whole seconds between start and completion; absent until the batch ran for >= 1s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    pub avg_emissions_per_activity: f64,
}

impl BatchDetail {
    pub fn from_batch(batch: &BatchJob) -> Self {
        let duration_seconds = batch
            .duration_ms()
            .map(|ms| ms / 1000)
            .filter(|secs| *secs > 0);

        let avg_emissions_per_activity = if batch.activity_count > 0 {
            batch.total_emissions / batch.activity_count as f64
        } else {
            0.0
        };

        Self {
            id: batch.id.clone(),
            org_id: batch.org_id.clone(),
            workspace_id: batch.workspace_id.clone(),
            status: batch.status,
            activity_count: batch.activity_count,
            success_count: batch.success_count,
            error_count: batch.error_count,
            total_emissions: batch.total_emissions,
            progress_percent: batch.progress_percent(),
            remaining_count: batch.remaining_activities(),
            started_at: batch.started_at,
            completed_at: batch.completed_at,
            error_message: batch.error_message.clone(),
            retry_count: batch.retry_count,
            max_retries: batch.max_retries,
            priority: batch.priority,
            created_at: batch.created_at,
            updated_at: batch.updated_at,
            duration_seconds,
            avg_emissions_per_activity,
        }
    }
}

/// Progress of a running batch with a naive time estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub batch_id: BatchId,
    pub status: JobStatus,
    pub processed_count: i64,
    pub total_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub percent_complete: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<i64>,
    pub total_emissions: f64,
    pub avg_emissions_per_item: f64,
}

impl ProgressReport {
    /// Estimate = (updated_at - started_at) / processed * remaining.
    /// Only computed once the batch started and at least one item finished.
    pub fn from_batch(batch: &BatchJob) -> Self {
        let processed = batch.processed_count();
        let remaining = batch.remaining_activities();

        let avg_emissions_per_item = if processed > 0 {
            batch.total_emissions / processed as f64
        } else {
            0.0
        };

        let estimated_remaining_ms = match batch.started_at {
            Some(started) if remaining > 0 && processed > 0 => {
                let elapsed = batch.updated_at - started;
                (elapsed > 0).then(|| elapsed / processed * remaining)
            }
            _ => None,
        };

        Self {
            batch_id: batch.id.clone(),
            status: batch.status,
            processed_count: processed,
            total_count: batch.activity_count,
            success_count: batch.success_count,
            error_count: batch.error_count,
            percent_complete: batch.progress_percent(),
            estimated_remaining_ms,
            total_emissions: batch.total_emissions,
            avg_emissions_per_item,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_batch() -> BatchJob {
        let mut batch = BatchJob::new_test(10);
        batch.status = JobStatus::Processing;
        batch.started_at = Some(10_000);
        batch.updated_at = 14_000;
        batch.success_count = 3;
        batch.error_count = 1;
        batch.total_emissions = 9.0;
        batch
    }

    #[test]
    fn test_progress_estimate() {
        let report = ProgressReport::from_batch(&running_batch());
        assert_eq!(report.processed_count, 4);
        // 4000ms / 4 items * 6 remaining
        assert_eq!(report.estimated_remaining_ms, Some(6_000));
        assert_eq!(report.avg_emissions_per_item, 2.25);
        assert_eq!(report.percent_complete, 0.4);
    }

    #[test]
    fn test_no_estimate_before_first_item() {
        let mut batch = running_batch();
        batch.success_count = 0;
        batch.error_count = 0;
        batch.total_emissions = 0.0;

        let report = ProgressReport::from_batch(&batch);
        assert!(report.estimated_remaining_ms.is_none());
        assert_eq!(report.avg_emissions_per_item, 0.0);
    }

    #[test]
    fn test_no_estimate_when_not_started() {
        let mut batch = running_batch();
        batch.started_at = None;
        assert!(ProgressReport::from_batch(&batch).estimated_remaining_ms.is_none());
    }

    #[test]
    fn test_detail_duration_and_average() {
        let mut batch = running_batch();
        batch.status = JobStatus::Complete;
        batch.success_count = 9;
        batch.error_count = 1;
        batch.total_emissions = 20.0;
        batch.completed_at = Some(13_500);

        let detail = BatchDetail::from_batch(&batch);
        assert_eq!(detail.duration_seconds, Some(3));
        assert_eq!(detail.avg_emissions_per_activity, 2.0);
        assert_eq!(detail.remaining_count, 0);
        assert_eq!(detail.progress_percent, 1.0);
    }

    #[test]
    fn test_detail_sub_second_duration_omitted() {
        let mut batch = running_batch();
        batch.completed_at = Some(10_400);
        assert!(BatchDetail::from_batch(&batch).duration_seconds.is_none());

        let json = serde_json::to_value(BatchDetail::from_batch(&batch)).unwrap();
        assert!(json.get("duration_seconds").is_none());
        assert_eq!(json["status"], "processing");
    }
}
