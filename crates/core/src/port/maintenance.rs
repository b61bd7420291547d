// Store maintenance port
use crate::error::Result;
use async_trait::async_trait;

/// Store maintenance statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceStats {
    pub db_size_mb: f64,
    pub db_size_bytes: i64,
    pub batch_count: i64,
    pub finished_batch_count: i64,
    pub activity_ref_count: i64,
    pub progress_log_count: i64,
}

/// Maintenance configuration
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Retention period for finished (complete/failed/cancelled) batches, in days
    pub finished_batch_retention_days: i64,

    /// Maximum DB size before forcing VACUUM (MB)
    pub max_db_size_mb: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            finished_batch_retention_days: 30,
            max_db_size_mb: 1000.0,
        }
    }
}

/// Store maintenance operations
#[async_trait]
pub trait Maintenance: Send + Sync {
    /// Reclaim space
    ///
    /// # Returns
    /// Space reclaimed in MB
    async fn vacuum(&self) -> Result<f64>;

    /// Delete finished batches completed before the retention cutoff.
    /// Refs and progress log rows go with them.
    ///
    /// # Returns
    /// Number of batches deleted
    async fn gc_finished_batches(&self, retention_days: i64) -> Result<i64>;

    async fn get_stats(&self) -> Result<MaintenanceStats>;

    /// GC, then VACUUM when the store grew past `max_db_size_mb`
    async fn run_full_maintenance(&self, config: &MaintenanceConfig) -> Result<MaintenanceStats> {
        let stats_before = self.get_stats().await?;

        let deleted_batches = self
            .gc_finished_batches(config.finished_batch_retention_days)
            .await?;

        let reclaimed_mb = if stats_before.db_size_mb > config.max_db_size_mb {
            self.vacuum().await?
        } else {
            0.0
        };

        let stats_after = self.get_stats().await?;

        tracing::info!(
            deleted_batches = deleted_batches,
            reclaimed_mb = reclaimed_mb,
            db_size_mb = stats_after.db_size_mb,
            remaining_batches = stats_after.batch_count,
            "Maintenance completed"
        );

        Ok(stats_after)
    }
}
