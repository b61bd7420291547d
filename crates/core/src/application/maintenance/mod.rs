// Maintenance Service
// Periodic GC of finished batches and VACUUM

use crate::application::retry::BackoffPolicy;
use crate::application::scheduler::ShutdownToken;
use crate::error::Result;
use crate::port::{Maintenance, MaintenanceConfig, MaintenanceStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

/// Maintenance scheduler
///
/// Runs full maintenance every `interval`, retrying a failed run with backoff
pub struct MaintenanceScheduler {
    maintenance: Arc<dyn Maintenance>,
    config: MaintenanceConfig,
    interval: Duration,
    backoff: BackoffPolicy,
}

impl MaintenanceScheduler {
    /// Create a new maintenance scheduler
    ///
    /// # Arguments
    /// * `maintenance` - Maintenance implementation
    /// * `config` - Maintenance configuration
    /// * `interval` - How often to run maintenance
    /// * `backoff` - Retry policy for a failed run
    pub fn new(
        maintenance: Arc<dyn Maintenance>,
        config: MaintenanceConfig,
        interval: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            maintenance,
            config,
            interval,
            backoff,
        }
    }

    /// Run maintenance loop until shutdown (spawn with tokio::spawn)
    pub async fn run(self, mut shutdown: ShutdownToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_days = self.config.finished_batch_retention_days,
            "Maintenance scheduler started"
        );

        let mut tick = interval(self.interval);
        // First tick fires immediately; skip it so startup is not slowed by GC
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.wait() => break,
            }

            let run = self
                .backoff
                .retry("maintenance", || self.maintenance.run_full_maintenance(&self.config));

            tokio::select! {
                result = run => match result {
                    Ok(stats) => info!(
                        db_size_mb = stats.db_size_mb,
                        batch_count = stats.batch_count,
                        finished_batches = stats.finished_batch_count,
                        "Scheduled maintenance completed successfully"
                    ),
                    Err(e) => error!(error = %e, "Scheduled maintenance failed"),
                },
                _ = shutdown.wait() => break,
            }
        }

        info!("Maintenance scheduler stopped");
    }

    /// Run maintenance immediately (manual trigger)
    pub async fn run_now(&self) -> Result<MaintenanceStats> {
        info!("Running manual maintenance...");
        let stats = self.maintenance.run_full_maintenance(&self.config).await?;
        info!(
            db_size_mb = stats.db_size_mb,
            batch_count = stats.batch_count,
            "Manual maintenance completed"
        );
        Ok(stats)
    }
}
