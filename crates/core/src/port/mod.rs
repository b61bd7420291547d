// Port Layer - Interfaces for external dependencies

pub mod activity_processor;
pub mod batch_store;
pub mod id_provider; // For deterministic testing
pub mod maintenance;
pub mod memory_store;
pub mod time_provider;

// Re-exports
pub use activity_processor::{ActivityContext, ActivityProcessor, ProcessingError};
pub use batch_store::{BatchFilter, BatchStore, RefWriteFailure};
pub use id_provider::{IdProvider, RandomBatchIdProvider};
pub use maintenance::{Maintenance, MaintenanceConfig, MaintenanceStats};
pub use memory_store::InMemoryBatchStore;
pub use time_provider::{SystemTimeProvider, TimeProvider};
