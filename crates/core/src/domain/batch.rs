// Batch Job Domain Model

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Batch ID (`batch_<16 hex>`)
pub type BatchId = String;

/// Priority (higher number = polled first)
pub type Priority = i32;

/// Priority assigned when the submitter does not choose one
pub const DEFAULT_PRIORITY: Priority = 5;

/// Batch job status
///
/// `pending -> queued -> processing -> {complete, failed, cancelled}`.
/// A `failed` batch with remaining retry budget re-enters `pending`
/// through [`BatchJob::prepare_retry`] only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Complete,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses a status update may move *from* to reach `self`.
    ///
    /// `processing -> processing` is the reclaim of a batch whose worker
    /// lost its lock (crash, shutdown) before writing a final status.
    pub fn valid_predecessors(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Pending => &[],
            JobStatus::Queued => &[JobStatus::Pending],
            JobStatus::Processing => &[
                JobStatus::Pending,
                JobStatus::Queued,
                JobStatus::Processing,
            ],
            JobStatus::Complete | JobStatus::Failed => &[JobStatus::Processing],
            JobStatus::Cancelled => &[
                JobStatus::Pending,
                JobStatus::Queued,
                JobStatus::Processing,
            ],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.valid_predecessors().contains(self)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

/// Aggregate outcome written at the batch-completion boundary
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub success_count: i64,
    pub error_count: i64,
    pub total_emissions: f64,
}

impl BatchProgress {
    pub fn processed(&self) -> i64 {
        self.success_count + self.error_count
    }

    /// Counts as currently recorded on a batch
    pub fn from_batch(batch: &BatchJob) -> Self {
        Self {
            success_count: batch.success_count,
            error_count: batch.error_count,
            total_emissions: batch.total_emissions,
        }
    }

    /// Reject progress that could never belong to a batch of `activity_count`
    pub fn validate_against(&self, activity_count: i64) -> Result<()> {
        if self.success_count < 0 || self.error_count < 0 {
            return Err(DomainError::Validation(
                "progress counts must not be negative".to_string(),
            ));
        }
        if !self.total_emissions.is_finite() || self.total_emissions < 0.0 {
            return Err(DomainError::Validation(format!(
                "total emissions must be a non-negative number, got {}",
                self.total_emissions
            )));
        }
        if self.processed() > activity_count {
            return Err(DomainError::CountInvariant {
                success: self.success_count,
                error: self.error_count,
                activity_count,
            });
        }
        Ok(())
    }
}

/// Batch Job Entity
///
/// All timestamps are epoch milliseconds, injected by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: BatchId,
    pub org_id: String,
    pub workspace_id: String,
    pub status: JobStatus,

    // Fixed at creation
    pub activity_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub total_emissions: f64,

    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,

    pub retry_count: i64,
    pub max_retries: i64,
    pub priority: Priority,

    // Lock is held iff locked_by is set and locked_until > now
    pub locked_by: Option<String>,
    pub locked_until: Option<i64>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl BatchJob {
    /// Create a new pending batch
    ///
    /// # Arguments
    ///
    /// * `id` - Unique batch ID (injected, not generated)
    /// * `created_at` - Creation timestamp in epoch ms (injected, not system time)
    /// * `org_id` / `workspace_id` - Tenancy scope
    /// * `activity_count` - Number of activities; never changes afterwards
    /// * `max_retries` - Retry budget for batch-level failures
    pub fn new(
        id: impl Into<String>,
        created_at: i64,
        org_id: impl Into<String>,
        workspace_id: impl Into<String>,
        activity_count: i64,
        max_retries: i64,
    ) -> Self {
        Self {
            id: id.into(),
            org_id: org_id.into(),
            workspace_id: workspace_id.into(),
            status: JobStatus::Pending,
            activity_count,
            success_count: 0,
            error_count: 0,
            total_emissions: 0.0,
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            max_retries,
            priority: DEFAULT_PRIORITY,
            locked_by: None,
            locked_until: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Create a test batch with deterministic ID and timestamp.
    ///
    /// IDs are `batch_test_1`, `batch_test_2`, ...; timestamps start at 1000
    /// and increment by 1000. Tests only: production code injects ID and time
    /// via providers.
    pub fn new_test(activity_count: i64) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        Self::new(
            format!("batch_test_{}", counter),
            (counter * 1000) as i64,
            "org_test",
            "ws_test",
            activity_count,
            3,
        )
    }

    pub fn processed_count(&self) -> i64 {
        self.success_count + self.error_count
    }

    /// Fraction of activities accounted for, in `[0, 1]`
    pub fn progress_percent(&self) -> f64 {
        if self.activity_count == 0 {
            return 0.0;
        }
        self.processed_count() as f64 / self.activity_count as f64
    }

    pub fn remaining_activities(&self) -> i64 {
        self.activity_count - self.processed_count()
    }

    pub fn is_locked(&self, now_millis: i64) -> bool {
        match (&self.locked_by, self.locked_until) {
            (Some(owner), Some(until)) => !owner.is_empty() && until > now_millis,
            _ => false,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }

    /// Move to `next`, stamping `started_at` / `completed_at`
    pub fn transition_to(&mut self, next: JobStatus, now_millis: i64) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if next == JobStatus::Processing {
            self.started_at = Some(now_millis);
        }
        if next.is_terminal() {
            self.completed_at = Some(now_millis);
        }
        self.status = next;
        self.updated_at = now_millis;
        Ok(())
    }

    /// Overwrite counts with an aggregate computed by a worker
    pub fn apply_progress(&mut self, progress: &BatchProgress, now_millis: i64) -> Result<()> {
        progress.validate_against(self.activity_count)?;
        self.success_count = progress.success_count;
        self.error_count = progress.error_count;
        self.total_emissions = progress.total_emissions;
        self.updated_at = now_millis;
        Ok(())
    }

    pub fn record_activity_success(&mut self, emissions: f64, now_millis: i64) -> Result<()> {
        if !emissions.is_finite() || emissions < 0.0 {
            return Err(DomainError::Validation(format!(
                "activity emissions must be a non-negative number, got {}",
                emissions
            )));
        }
        self.ensure_room_for_outcome()?;
        self.success_count += 1;
        self.total_emissions += emissions;
        self.updated_at = now_millis;
        Ok(())
    }

    pub fn record_activity_failure(&mut self, now_millis: i64) -> Result<()> {
        self.ensure_room_for_outcome()?;
        self.error_count += 1;
        self.updated_at = now_millis;
        Ok(())
    }

    fn ensure_room_for_outcome(&self) -> Result<()> {
        if self.processed_count() >= self.activity_count {
            return Err(DomainError::CountInvariant {
                success: self.success_count,
                error: self.error_count,
                activity_count: self.activity_count,
            });
        }
        Ok(())
    }

    /// Batch-level failure with a message for pollers
    pub fn fail(&mut self, message: impl Into<String>, now_millis: i64) -> Result<()> {
        self.transition_to(JobStatus::Failed, now_millis)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Re-enter `pending` for another attempt: increments `retry_count`,
    /// resets counts and timestamps.
    pub fn prepare_retry(&mut self, now_millis: i64) -> Result<()> {
        if self.status != JobStatus::Failed {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: JobStatus::Pending.to_string(),
            });
        }
        if self.retry_count >= self.max_retries {
            return Err(DomainError::RetryExhausted {
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        self.retry_count += 1;
        self.status = JobStatus::Pending;
        self.success_count = 0;
        self.error_count = 0;
        self.total_emissions = 0.0;
        self.started_at = None;
        self.completed_at = None;
        self.error_message = None;
        self.updated_at = now_millis;
        Ok(())
    }

    /// Claim the batch unless another worker holds an unexpired lock
    pub fn try_lock(&mut self, worker_id: &str, until_millis: i64, now_millis: i64) -> bool {
        if self.is_locked(now_millis) {
            return false;
        }
        self.locked_by = Some(worker_id.to_string());
        self.locked_until = Some(until_millis);
        true
    }

    pub fn unlock(&mut self) {
        self.locked_by = None;
        self.locked_until = None;
    }
}
