// Domain Layer - Batch jobs, activity references and derived views

pub mod activity;
pub mod batch;
pub mod error;
pub mod progress_log;
pub mod report;

// Re-exports
pub use activity::{ActivityRecord, ActivityRef, ActivityStatus};
pub use batch::{BatchId, BatchJob, BatchProgress, JobStatus, Priority, DEFAULT_PRIORITY};
pub use error::DomainError;
pub use progress_log::{BatchProgressLog, ProgressEvent};
pub use report::{BatchDetail, ProgressReport};
