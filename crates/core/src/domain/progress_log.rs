// Append-only progress events per batch

use crate::domain::batch::{BatchId, BatchJob, JobStatus};
use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressEvent {
    Created,
    Queued,
    Started,
    Completed,
    Failed,
    Cancelled,
    Requeued,
}

impl ProgressEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressEvent::Created => "created",
            ProgressEvent::Queued => "queued",
            ProgressEvent::Started => "started",
            ProgressEvent::Completed => "completed",
            ProgressEvent::Failed => "failed",
            ProgressEvent::Cancelled => "cancelled",
            ProgressEvent::Requeued => "requeued",
        }
    }

    /// Event recorded when a batch enters `status`
    pub fn for_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => ProgressEvent::Requeued,
            JobStatus::Queued => ProgressEvent::Queued,
            JobStatus::Processing => ProgressEvent::Started,
            JobStatus::Complete => ProgressEvent::Completed,
            JobStatus::Failed => ProgressEvent::Failed,
            JobStatus::Cancelled => ProgressEvent::Cancelled,
        }
    }
}

impl std::fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressEvent {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(ProgressEvent::Created),
            "queued" => Ok(ProgressEvent::Queued),
            "started" => Ok(ProgressEvent::Started),
            "completed" => Ok(ProgressEvent::Completed),
            "failed" => Ok(ProgressEvent::Failed),
            "cancelled" => Ok(ProgressEvent::Cancelled),
            "requeued" => Ok(ProgressEvent::Requeued),
            other => Err(DomainError::Validation(format!(
                "unknown progress event: {}",
                other
            ))),
        }
    }
}

/// One row of the progress log. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgressLog {
    /// Store-assigned sequence (0 until persisted)
    pub id: i64,
    pub batch_id: BatchId,
    pub event_type: ProgressEvent,
    pub processed_count: i64,
    pub error_count: i64,
    pub total_emissions: f64,
    pub timestamp: i64,
}

impl BatchProgressLog {
    /// Snapshot of `batch` counts tagged with `event`
    pub fn snapshot(batch: &BatchJob, event: ProgressEvent, timestamp: i64) -> Self {
        Self {
            id: 0,
            batch_id: batch.id.clone(),
            event_type: event,
            processed_count: batch.processed_count(),
            error_count: batch.error_count,
            total_emissions: batch.total_emissions,
            timestamp,
        }
    }
}
