// Application Layer - Use Cases and Business Logic

pub mod batch_service;
pub mod maintenance;
pub mod retry;
pub mod scheduler;

// Re-exports
pub use batch_service::BatchService;
pub use maintenance::MaintenanceScheduler;
pub use retry::{BackoffPolicy, RetryDecision, RetryPolicy};
pub use scheduler::{
    shutdown_channel, BatchScheduler, HealthState, HealthStatus, SchedulerConfig, SchedulerStats,
    ShutdownSender, ShutdownToken, SubmitBatchRequest,
};
