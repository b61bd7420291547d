// Activity references tracked per batch

use crate::domain::batch::BatchId;
use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Pending,
    Complete,
    Failed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Pending => "pending",
            ActivityStatus::Complete => "complete",
            ActivityStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, ActivityStatus::Pending)
    }
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(ActivityStatus::Pending),
            "complete" => Ok(ActivityStatus::Complete),
            "failed" => Ok(ActivityStatus::Failed),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

/// Link from a batch to one activity under processing
///
/// Flipped out of `pending` exactly once per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRef {
    pub batch_id: BatchId,
    pub activity_id: String,
    pub status: ActivityStatus,
    pub error_message: Option<String>,
    pub emissions: Option<f64>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ActivityRef {
    pub fn new(batch_id: impl Into<String>, activity_id: impl Into<String>, now_millis: i64) -> Self {
        Self {
            batch_id: batch_id.into(),
            activity_id: activity_id.into(),
            status: ActivityStatus::Pending,
            error_message: None,
            emissions: None,
            metadata: None,
            created_at: now_millis,
            updated_at: now_millis,
        }
    }
}

/// Result of a successful emissions calculation for one activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// kg CO2e
    pub emissions: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ActivityRecord {
    pub fn new(emissions: f64) -> Self {
        Self {
            emissions,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.emissions.is_finite() || self.emissions < 0.0 {
            return Err(DomainError::Validation(format!(
                "activity emissions must be a non-negative number, got {}",
                self.emissions
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ref_is_pending() {
        let r = ActivityRef::new("batch_1", "act-1", 42);
        assert_eq!(r.status, ActivityStatus::Pending);
        assert!(!r.status.is_finished());
        assert_eq!(r.created_at, 42);
    }

    #[test]
    fn test_record_validation() {
        tokio_test::assert_ok!(ActivityRecord::new(0.0).validate());
        tokio_test::assert_ok!(ActivityRecord::new(12.5).validate());
        tokio_test::assert_err!(ActivityRecord::new(-0.1).validate());
        tokio_test::assert_err!(ActivityRecord::new(f64::INFINITY).validate());
    }

    #[test]
    fn test_record_deserializes_without_metadata() {
        let record: ActivityRecord = serde_json::from_str(r#"{"emissions": 3.25}"#).unwrap();
        assert_eq!(record.emissions, 3.25);
        assert!(record.metadata.is_none());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("failed".parse::<ActivityStatus>().unwrap(), ActivityStatus::Failed);
        assert!("done".parse::<ActivityStatus>().is_err());
    }
}
