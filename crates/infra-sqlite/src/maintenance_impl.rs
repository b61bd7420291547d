// SQLite Maintenance Implementation
use crate::error::map_sqlx_error;
use async_trait::async_trait;
use carbonbatch_core::error::{AppError, Result};
use carbonbatch_core::port::{Maintenance, MaintenanceStats, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// SQLite maintenance implementation
pub struct SqliteMaintenance {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteMaintenance {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    /// DB size in bytes from page_count * page_size
    async fn get_db_size_bytes(&self) -> Result<i64> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to get page count: {}", e)))?;

        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to get page size: {}", e)))?;

        Ok(page_count * page_size)
    }

    async fn count(&self, sql: &str) -> Result<i64> {
        sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }
}

fn to_mb(bytes: i64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[async_trait]
impl Maintenance for SqliteMaintenance {
    async fn vacuum(&self) -> Result<f64> {
        info!("Running VACUUM to optimize database...");

        let size_before = to_mb(self.get_db_size_bytes().await?);

        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("VACUUM failed: {}", e)))?;

        let size_after = to_mb(self.get_db_size_bytes().await?);
        let reclaimed = (size_before - size_after).max(0.0);

        info!(
            size_before_mb = size_before,
            size_after_mb = size_after,
            reclaimed_mb = reclaimed,
            "VACUUM completed"
        );

        Ok(reclaimed)
    }

    async fn gc_finished_batches(&self, retention_days: i64) -> Result<i64> {
        let cutoff_time = self
            .time_provider
            .now_millis()
            .saturating_sub(retention_days.saturating_mul(MILLIS_PER_DAY));

        info!(
            retention_days = retention_days,
            cutoff_time = cutoff_time,
            "Running finished batch GC"
        );

        // Refs and progress log rows cascade
        let result = sqlx::query(
            r#"
            DELETE FROM batch_jobs
            WHERE status IN ('complete', 'failed', 'cancelled')
            AND COALESCE(completed_at, updated_at) < ?
            "#,
        )
        .bind(cutoff_time)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("Batch GC failed: {}", e)))?;

        let deleted = result.rows_affected() as i64;

        info!(deleted_batches = deleted, "Finished batch GC completed");

        Ok(deleted)
    }

    async fn get_stats(&self) -> Result<MaintenanceStats> {
        let db_size_bytes = self.get_db_size_bytes().await?;

        Ok(MaintenanceStats {
            db_size_mb: to_mb(db_size_bytes),
            db_size_bytes,
            batch_count: self.count("SELECT COUNT(*) FROM batch_jobs").await?,
            finished_batch_count: self
                .count(
                    "SELECT COUNT(*) FROM batch_jobs WHERE status IN ('complete', 'failed', 'cancelled')",
                )
                .await?,
            activity_ref_count: self.count("SELECT COUNT(*) FROM batch_activity_refs").await?,
            progress_log_count: self.count("SELECT COUNT(*) FROM batch_progress_log").await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations, SqliteBatchStore};
    use carbonbatch_core::domain::{BatchJob, JobStatus};
    use carbonbatch_core::port::time_provider::mocks::ManualTimeProvider;
    use carbonbatch_core::port::{BatchStore, MaintenanceConfig};

    const NOW: i64 = 1_700_000_000_000;

    async fn setup() -> (SqliteBatchStore, SqliteMaintenance) {
        let pool = create_pool("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let time = Arc::new(ManualTimeProvider::new(NOW));
        (
            SqliteBatchStore::new(pool.clone(), time.clone()),
            SqliteMaintenance::new(pool, time),
        )
    }

    fn finished(id: &str, status: JobStatus, completed_at: i64) -> BatchJob {
        let mut batch = BatchJob::new(id, completed_at - 1_000, "org", "ws", 1, 3);
        batch.status = status;
        batch.started_at = Some(completed_at - 500);
        batch.completed_at = Some(completed_at);
        batch.updated_at = completed_at;
        batch
    }

    #[tokio::test]
    async fn test_maintenance_stats() {
        let (_, maintenance) = setup().await;
        let stats = maintenance.get_stats().await.unwrap();

        assert!(stats.db_size_bytes > 0);
        assert!(stats.db_size_mb > 0.0);
        assert_eq!(stats.batch_count, 0);
        assert_eq!(stats.finished_batch_count, 0);
    }

    #[tokio::test]
    async fn test_vacuum() {
        let (_, maintenance) = setup().await;
        let reclaimed = maintenance.vacuum().await.unwrap();
        assert!(reclaimed >= 0.0);
    }

    #[tokio::test]
    async fn test_gc_finished_batches() {
        let (store, maintenance) = setup().await;
        let ten_days_ago = NOW - 10 * MILLIS_PER_DAY;

        store
            .create_batch(&finished("batch_old", JobStatus::Complete, ten_days_ago))
            .await
            .unwrap();
        store.add_activity_ref("batch_old", "a1").await.unwrap();
        store
            .create_batch(&finished("batch_recent", JobStatus::Failed, NOW - 1_000))
            .await
            .unwrap();
        // Old but still open: never collected
        store
            .create_batch(&BatchJob::new("batch_open", ten_days_ago, "org", "ws", 1, 3))
            .await
            .unwrap();

        let deleted = maintenance.gc_finished_batches(7).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_batch("batch_old").await.unwrap().is_none());
        assert!(store.get_batch("batch_recent").await.unwrap().is_some());
        assert!(store.get_batch("batch_open").await.unwrap().is_some());

        let stats = maintenance.get_stats().await.unwrap();
        assert_eq!(stats.batch_count, 2);
        assert_eq!(stats.finished_batch_count, 1);
        assert_eq!(stats.activity_ref_count, 0);
        assert_eq!(stats.progress_log_count, 2);
    }

    #[tokio::test]
    async fn test_full_maintenance() {
        let (store, maintenance) = setup().await;
        store
            .create_batch(&finished("batch_old", JobStatus::Cancelled, NOW - 40 * MILLIS_PER_DAY))
            .await
            .unwrap();

        let config = MaintenanceConfig {
            finished_batch_retention_days: 30,
            max_db_size_mb: 0.0,
        };
        let stats = maintenance.run_full_maintenance(&config).await.unwrap();
        assert_eq!(stats.batch_count, 0);
    }
}
