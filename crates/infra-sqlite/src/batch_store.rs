// SQLite BatchStore Implementation
// Every state change is a conditional UPDATE; zero affected rows is diagnosed
// afterwards (missing row vs. wrong state) inside the same transaction.

use crate::error::{is_foreign_key_violation, is_unique_violation, map_sqlx_error};
use async_trait::async_trait;
use carbonbatch_core::domain::{
    ActivityRecord, ActivityRef, ActivityStatus, BatchId, BatchJob, BatchProgress,
    BatchProgressLog, DomainError, JobStatus, ProgressEvent,
};
use carbonbatch_core::error::{AppError, Result};
use carbonbatch_core::port::{BatchFilter, BatchStore, RefWriteFailure, TimeProvider};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const BATCH_COLUMNS: &str = "id, org_id, workspace_id, status, activity_count, success_count, \
     error_count, total_emissions, started_at, completed_at, error_message, retry_count, \
     max_retries, priority, locked_by, locked_until, created_at, updated_at";

/// A lock row is free when nobody owns it or the lease ran out
const UNLOCKED: &str =
    "(locked_by IS NULL OR locked_by = '' OR locked_until IS NULL OR locked_until <= ?)";

pub struct SqliteBatchStore {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteBatchStore {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    /// Conditional status write shared by `update_batch_status` and `mark_batch_failed`
    async fn transition(
        &self,
        batch_id: &str,
        status: JobStatus,
        progress: Option<&BatchProgress>,
        error_message: Option<&str>,
    ) -> Result<()> {
        if let Some(progress) = progress {
            // Upper bound is checked against the row in the WHERE clause
            progress.validate_against(i64::MAX)?;
        }

        let now = self.time_provider.now_millis();
        let predecessors = status.valid_predecessors();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        if predecessors.is_empty() {
            return Err(match fetch_batch(&mut tx, batch_id).await? {
                Some(current) => invalid_transition(&current, status),
                None => not_found(batch_id),
            });
        }

        let mut sql = String::from("UPDATE batch_jobs SET status = ?, updated_at = ?");
        if status == JobStatus::Processing {
            sql.push_str(", started_at = ?");
        }
        if status.is_terminal() {
            sql.push_str(", completed_at = ?");
        }
        if progress.is_some() {
            sql.push_str(", success_count = ?, error_count = ?, total_emissions = ?");
        }
        if error_message.is_some() {
            sql.push_str(", error_message = ?");
        }
        sql.push_str(&format!(
            " WHERE id = ? AND status IN ({})",
            status_list(predecessors)
        ));
        if progress.is_some() {
            sql.push_str(" AND ? <= activity_count");
        }

        let mut query = sqlx::query(&sql).bind(status.as_str()).bind(now);
        if status == JobStatus::Processing {
            query = query.bind(now);
        }
        if status.is_terminal() {
            query = query.bind(now);
        }
        if let Some(progress) = progress {
            query = query
                .bind(progress.success_count)
                .bind(progress.error_count)
                .bind(progress.total_emissions);
        }
        if let Some(message) = error_message {
            query = query.bind(message);
        }
        query = query.bind(batch_id);
        if let Some(progress) = progress {
            query = query.bind(progress.processed());
        }

        let result = query.execute(&mut *tx).await.map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(match fetch_batch(&mut tx, batch_id).await? {
                None => not_found(batch_id),
                Some(current) if !current.status.can_transition_to(status) => {
                    invalid_transition(&current, status)
                }
                Some(current) => {
                    let progress = progress.copied().unwrap_or_default();
                    DomainError::CountInvariant {
                        success: progress.success_count,
                        error: progress.error_count,
                        activity_count: current.activity_count,
                    }
                    .into()
                }
            });
        }

        append_log(&mut tx, batch_id, ProgressEvent::for_status(status), now).await?;
        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(batch_id = %batch_id, status = %status, "Batch status updated");
        Ok(())
    }

    /// Count one activity outcome on the batch and flip its ref, atomically
    async fn record_outcome(
        &self,
        batch_id: &str,
        activity_id: &str,
        outcome: RefOutcome<'_>,
    ) -> Result<()> {
        let now = self.time_provider.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let counted = match outcome {
            RefOutcome::Complete(record) => sqlx::query(
                r#"
                UPDATE batch_jobs
                SET success_count = success_count + 1,
                    total_emissions = total_emissions + ?,
                    updated_at = ?
                WHERE id = ? AND success_count + error_count < activity_count
                "#,
            )
            .bind(record.emissions)
            .bind(now)
            .bind(batch_id),
            RefOutcome::Failed(_) => sqlx::query(
                r#"
                UPDATE batch_jobs
                SET error_count = error_count + 1, updated_at = ?
                WHERE id = ? AND success_count + error_count < activity_count
                "#,
            )
            .bind(now)
            .bind(batch_id),
        }
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if counted.rows_affected() == 0 {
            return Err(match fetch_batch(&mut tx, batch_id).await? {
                None => not_found(batch_id),
                Some(batch) => DomainError::CountInvariant {
                    success: batch.success_count,
                    error: batch.error_count,
                    activity_count: batch.activity_count,
                }
                .into(),
            });
        }

        let flipped = match outcome {
            RefOutcome::Complete(record) => {
                let metadata = record
                    .metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                sqlx::query(
                    r#"
                    UPDATE batch_activity_refs
                    SET status = 'complete', emissions = ?, metadata = ?, updated_at = ?
                    WHERE batch_id = ? AND activity_id = ? AND status = 'pending'
                    "#,
                )
                .bind(record.emissions)
                .bind(metadata)
                .bind(now)
                .bind(batch_id)
                .bind(activity_id)
                .execute(&mut *tx)
                .await
            }
            RefOutcome::Failed(reason) => {
                sqlx::query(
                    r#"
                    UPDATE batch_activity_refs
                    SET status = 'failed', error_message = ?, updated_at = ?
                    WHERE batch_id = ? AND activity_id = ? AND status = 'pending'
                    "#,
                )
                .bind(reason)
                .bind(now)
                .bind(batch_id)
                .bind(activity_id)
                .execute(&mut *tx)
                .await
            }
        }
        .map_err(map_sqlx_error)?;

        if flipped.rows_affected() == 0 {
            let exists: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM batch_activity_refs WHERE batch_id = ? AND activity_id = ?",
            )
            .bind(batch_id)
            .bind(activity_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            return Err(if exists == 0 {
                AppError::NotFound(format!("activity {} in batch {}", activity_id, batch_id))
            } else {
                AppError::Conflict(format!(
                    "activity {} in batch {} already finished",
                    activity_id, batch_id
                ))
            });
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum RefOutcome<'a> {
    Complete(&'a ActivityRecord),
    Failed(&'a str),
}

fn not_found(batch_id: &str) -> AppError {
    AppError::NotFound(format!("batch {}", batch_id))
}

fn invalid_transition(batch: &BatchJob, next: JobStatus) -> AppError {
    AppError::InvalidState(format!(
        "batch {} cannot move from {} to {}",
        batch.id, batch.status, next
    ))
}

/// `'a', 'b'` literal list for an IN clause (values come from `JobStatus::as_str`)
fn status_list(statuses: &[JobStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

async fn fetch_batch(conn: &mut SqliteConnection, batch_id: &str) -> Result<Option<BatchJob>> {
    let row: Option<BatchRow> = sqlx::query_as(&format!(
        "SELECT {} FROM batch_jobs WHERE id = ?",
        BATCH_COLUMNS
    ))
    .bind(batch_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    row.map(BatchRow::into_batch).transpose()
}

/// Snapshot the batch's current counts into the progress log
async fn append_log(
    conn: &mut SqliteConnection,
    batch_id: &str,
    event: ProgressEvent,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO batch_progress_log
            (batch_id, event_type, processed_count, error_count, total_emissions, timestamp)
        SELECT id, ?, success_count + error_count, error_count, total_emissions, ?
        FROM batch_jobs WHERE id = ?
        "#,
    )
    .bind(event.as_str())
    .bind(now)
    .bind(batch_id)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

async fn insert_batch(conn: &mut SqliteConnection, batch: &BatchJob) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO batch_jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        BATCH_COLUMNS
    ))
    .bind(&batch.id)
    .bind(&batch.org_id)
    .bind(&batch.workspace_id)
    .bind(batch.status.as_str())
    .bind(batch.activity_count)
    .bind(batch.success_count)
    .bind(batch.error_count)
    .bind(batch.total_emissions)
    .bind(batch.started_at)
    .bind(batch.completed_at)
    .bind(&batch.error_message)
    .bind(batch.retry_count)
    .bind(batch.max_retries)
    .bind(batch.priority)
    .bind(&batch.locked_by)
    .bind(batch.locked_until)
    .bind(batch.created_at)
    .bind(batch.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            AppError::Conflict(format!("batch {} already exists", batch.id))
        } else {
            map_sqlx_error(e)
        }
    })?;
    Ok(())
}

async fn insert_ref(
    conn: &mut SqliteConnection,
    batch_id: &str,
    activity_id: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO batch_activity_refs (batch_id, activity_id, status, created_at, updated_at)
        VALUES (?, ?, 'pending', ?, ?)
        "#,
    )
    .bind(batch_id)
    .bind(activity_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            AppError::Conflict(format!(
                "activity {} already tracked by batch {}",
                activity_id, batch_id
            ))
        } else if is_foreign_key_violation(&e) {
            not_found(batch_id)
        } else {
            map_sqlx_error(e)
        }
    })?;
    Ok(())
}

#[async_trait]
impl BatchStore for SqliteBatchStore {
    async fn create_batch(&self, batch: &BatchJob) -> Result<BatchId> {
        let now = self.time_provider.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        insert_batch(&mut tx, batch).await?;
        append_log(&mut tx, &batch.id, ProgressEvent::Created, now).await?;
        tx.commit().await.map_err(map_sqlx_error)?;

        info!(
            batch_id = %batch.id,
            org_id = %batch.org_id,
            activity_count = batch.activity_count,
            "Batch created"
        );
        Ok(batch.id.clone())
    }

    async fn add_activity_ref(&self, batch_id: &str, activity_id: &str) -> Result<()> {
        let now = self.time_provider.now_millis();
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        insert_ref(&mut conn, batch_id, activity_id, now).await
    }

    async fn create_batch_with_refs(
        &self,
        batch: &BatchJob,
        activity_ids: &[String],
    ) -> Result<Vec<RefWriteFailure>> {
        let now = self.time_provider.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        insert_batch(&mut tx, batch).await?;
        append_log(&mut tx, &batch.id, ProgressEvent::Created, now).await?;

        // A failed INSERT only rolls back its own statement
        let mut failures = Vec::new();
        for activity_id in activity_ids {
            if let Err(e) = insert_ref(&mut tx, &batch.id, activity_id, now).await {
                failures.push(RefWriteFailure {
                    activity_id: activity_id.clone(),
                    error: e.to_string(),
                });
            }
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        info!(
            batch_id = %batch.id,
            org_id = %batch.org_id,
            activity_count = batch.activity_count,
            failed_refs = failures.len(),
            "Batch created with refs"
        );
        Ok(failures)
    }

    async fn get_pending_batches(&self, limit: usize) -> Result<Vec<BatchJob>> {
        let now = self.time_provider.now_millis();
        let open: Vec<JobStatus> = JobStatus::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect();

        let rows: Vec<BatchRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM batch_jobs
            WHERE status IN ({}) AND {}
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT ?
            "#,
            BATCH_COLUMNS,
            status_list(&open),
            UNLOCKED
        ))
        .bind(now)
        .bind(to_sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(BatchRow::into_batch).collect()
    }

    async fn acquire_batch_lock(
        &self,
        batch_id: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let now = self.time_provider.now_millis();
        let until = now.saturating_add(timeout.as_millis() as i64);

        // Single conditional write: the row is the arbiter between workers
        let result = sqlx::query(&format!(
            "UPDATE batch_jobs SET locked_by = ?, locked_until = ? WHERE id = ? AND {}",
            UNLOCKED
        ))
        .bind(worker_id)
        .bind(until)
        .bind(batch_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 1 {
            debug!(batch_id = %batch_id, worker_id = %worker_id, locked_until = until, "Batch lock acquired");
            return Ok(true);
        }

        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batch_jobs WHERE id = ?")
            .bind(batch_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if exists == 0 {
            return Err(not_found(batch_id));
        }
        Ok(false)
    }

    async fn release_batch_lock(&self, batch_id: &str) -> Result<()> {
        sqlx::query("UPDATE batch_jobs SET locked_by = NULL, locked_until = NULL WHERE id = ?")
            .bind(batch_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn update_batch_status(
        &self,
        batch_id: &str,
        status: JobStatus,
        progress: Option<&BatchProgress>,
    ) -> Result<()> {
        self.transition(batch_id, status, progress, None).await
    }

    async fn mark_activity_complete(
        &self,
        batch_id: &str,
        activity_id: &str,
        record: &ActivityRecord,
    ) -> Result<()> {
        record.validate()?;
        self.record_outcome(batch_id, activity_id, RefOutcome::Complete(record))
            .await
    }

    async fn mark_activity_failed(
        &self,
        batch_id: &str,
        activity_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.record_outcome(batch_id, activity_id, RefOutcome::Failed(reason))
            .await
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchJob>> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        fetch_batch(&mut conn, batch_id).await
    }

    async fn list_batches(&self, org_id: &str, filter: &BatchFilter) -> Result<Vec<BatchJob>> {
        let status = filter.status.map(|s| s.as_str());
        let rows: Vec<BatchRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM batch_jobs
            WHERE org_id = ? AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
            BATCH_COLUMNS
        ))
        .bind(org_id)
        .bind(status)
        .bind(status)
        .bind(to_sql_limit(filter.limit))
        .bind(to_sql_limit(filter.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(BatchRow::into_batch).collect()
    }

    async fn get_activity_refs(&self, batch_id: &str) -> Result<Vec<ActivityRef>> {
        let rows: Vec<ActivityRefRow> = sqlx::query_as(
            r#"
            SELECT batch_id, activity_id, status, error_message, emissions, metadata,
                   created_at, updated_at
            FROM batch_activity_refs
            WHERE batch_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(ActivityRefRow::into_ref).collect()
    }

    async fn mark_batch_failed(
        &self,
        batch_id: &str,
        error_message: &str,
        progress: Option<&BatchProgress>,
    ) -> Result<()> {
        self.transition(batch_id, JobStatus::Failed, progress, Some(error_message))
            .await
    }

    async fn requeue_batch(&self, batch_id: &str) -> Result<bool> {
        let now = self.time_provider.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let result = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'pending',
                retry_count = retry_count + 1,
                success_count = 0,
                error_count = 0,
                total_emissions = 0,
                started_at = NULL,
                completed_at = NULL,
                error_message = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'failed' AND retry_count < max_retries
            "#,
        )
        .bind(now)
        .bind(batch_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return match fetch_batch(&mut tx, batch_id).await? {
                Some(_) => Ok(false),
                None => Err(not_found(batch_id)),
            };
        }

        sqlx::query(
            r#"
            UPDATE batch_activity_refs
            SET status = 'pending', error_message = NULL, emissions = NULL,
                metadata = NULL, updated_at = ?
            WHERE batch_id = ?
            "#,
        )
        .bind(now)
        .bind(batch_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        append_log(&mut tx, batch_id, ProgressEvent::Requeued, now).await?;
        tx.commit().await.map_err(map_sqlx_error)?;

        info!(batch_id = %batch_id, "Batch requeued for retry");
        Ok(true)
    }

    async fn get_retryable_batches(&self, limit: usize) -> Result<Vec<BatchJob>> {
        let rows: Vec<BatchRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM batch_jobs
            WHERE status = 'failed' AND retry_count < max_retries
            ORDER BY updated_at ASC, id ASC
            LIMIT ?
            "#,
            BATCH_COLUMNS
        ))
        .bind(to_sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(BatchRow::into_batch).collect()
    }

    async fn delete_batch(&self, batch_id: &str) -> Result<bool> {
        // Refs and log rows follow via ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM batch_jobs WHERE id = ?")
            .bind(batch_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_progress_log(&self, batch_id: &str) -> Result<Vec<BatchProgressLog>> {
        let rows: Vec<ProgressLogRow> = sqlx::query_as(
            r#"
            SELECT id, batch_id, event_type, processed_count, error_count, total_emissions, timestamp
            FROM batch_progress_log
            WHERE batch_id = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(ProgressLogRow::into_entry).collect()
    }
}

// Internal row types for sqlx mapping
#[derive(Debug, sqlx::FromRow)]
struct BatchRow {
    id: String,
    org_id: String,
    workspace_id: String,
    status: String,
    activity_count: i64,
    success_count: i64,
    error_count: i64,
    total_emissions: f64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    error_message: Option<String>,
    retry_count: i64,
    max_retries: i64,
    priority: i32,
    locked_by: Option<String>,
    locked_until: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl BatchRow {
    fn into_batch(self) -> Result<BatchJob> {
        Ok(BatchJob {
            status: self.status.parse()?,
            id: self.id,
            org_id: self.org_id,
            workspace_id: self.workspace_id,
            activity_count: self.activity_count,
            success_count: self.success_count,
            error_count: self.error_count,
            total_emissions: self.total_emissions,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            priority: self.priority,
            locked_by: self.locked_by,
            locked_until: self.locked_until,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ActivityRefRow {
    batch_id: String,
    activity_id: String,
    status: String,
    error_message: Option<String>,
    emissions: Option<f64>,
    metadata: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl ActivityRefRow {
    fn into_ref(self) -> Result<ActivityRef> {
        let status: ActivityStatus = self.status.parse()?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(ActivityRef {
            batch_id: self.batch_id,
            activity_id: self.activity_id,
            status,
            error_message: self.error_message,
            emissions: self.emissions,
            metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProgressLogRow {
    id: i64,
    batch_id: String,
    event_type: String,
    processed_count: i64,
    error_count: i64,
    total_emissions: f64,
    timestamp: i64,
}

impl ProgressLogRow {
    fn into_entry(self) -> Result<BatchProgressLog> {
        Ok(BatchProgressLog {
            event_type: self.event_type.parse()?,
            id: self.id,
            batch_id: self.batch_id,
            processed_count: self.processed_count,
            error_count: self.error_count,
            total_emissions: self.total_emissions,
            timestamp: self.timestamp,
        })
    }
}
