//! Batch Scheduler Definition of Done (DoD) Integration Tests
//!
//! Scheduler + SQLite store + processors wired the way the daemon wires them

use std::sync::Arc;
use std::time::Duration;

use carbonbatch_core::application::{BatchScheduler, BatchService, HealthState, SchedulerConfig};
use carbonbatch_core::domain::{ActivityStatus, BatchJob, JobStatus, ProgressEvent};
use carbonbatch_core::error::AppError;
use carbonbatch_core::port::activity_processor::mocks::{MockActivityProcessor, MockBehavior};
use carbonbatch_core::port::id_provider::mocks::SequentialIdProvider;
use carbonbatch_core::port::{ActivityProcessor, BatchStore, SystemTimeProvider, TimeProvider};
use carbonbatch_infra_sqlite::{create_pool, run_migrations, SqliteBatchStore};

async fn sqlite_store() -> Arc<SqliteBatchStore> {
    let pool = create_pool("sqlite::memory:", 1).await.unwrap();
    run_migrations(&pool).await.unwrap();
    Arc::new(SqliteBatchStore::new(pool, Arc::new(SystemTimeProvider)))
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        polling_interval: Duration::from_millis(25),
        jitter_range: Duration::from_millis(5),
        batch_timeout: Duration::from_secs(5),
        lock_timeout: Duration::from_secs(5),
        store_timeout: Duration::from_secs(2),
        instance_id: Some("dod".to_string()),
        ..SchedulerConfig::default()
    }
}

fn scheduler(
    store: Arc<SqliteBatchStore>,
    processor: Arc<dyn ActivityProcessor>,
    config: SchedulerConfig,
) -> BatchScheduler {
    BatchScheduler::new(
        store,
        processor,
        Arc::new(SystemTimeProvider),
        Arc::new(SequentialIdProvider::new()),
        config,
    )
    .unwrap()
}

fn activity_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("activity-{}", i)).collect()
}

async fn wait_for_status(store: &SqliteBatchStore, id: &str, status: JobStatus) -> BatchJob {
    for _ in 0..300 {
        let batch = store.get_batch(id).await.unwrap().unwrap();
        if batch.status == status && batch.locked_by.is_none() {
            return batch;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {} never reached {}", id, status);
}

/// DoD 1: A 10-activity batch with one failing activity completes with 9/1
#[tokio::test]
async fn test_ten_activity_batch_completes() {
    let store = sqlite_store().await;
    let processor = Arc::new(MockActivityProcessor::new_failing(["activity-3"], 1.5));
    let scheduler = scheduler(store.clone(), processor.clone(), fast_config());
    scheduler.start().unwrap();

    let id = scheduler
        .submit_batch("org_acme", "ws_scope3", &activity_ids(10), Some(3))
        .await
        .unwrap();

    let batch = wait_for_status(&store, &id, JobStatus::Complete).await;
    assert_eq!(batch.activity_count, 10);
    assert_eq!(batch.success_count, 9);
    assert_eq!(batch.error_count, 1);
    assert_eq!(batch.total_emissions, 13.5);
    assert!(batch.started_at.is_some());
    assert!(batch.completed_at >= batch.started_at);
    assert_eq!(processor.call_count(), 10);

    let refs = store.get_activity_refs(&id).await.unwrap();
    assert!(refs.iter().all(|r| r.status.is_finished()));
    let failed = refs
        .iter()
        .find(|r| r.status == ActivityStatus::Failed)
        .unwrap();
    assert_eq!(failed.activity_id, "activity-3");

    let events: Vec<_> = store
        .get_progress_log(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        events,
        vec![
            ProgressEvent::Created,
            ProgressEvent::Started,
            ProgressEvent::Completed
        ]
    );

    let service = BatchService::new(store.clone(), Arc::new(SystemTimeProvider));
    let detail = service.get_batch(&id).await.unwrap();
    assert_eq!(detail.progress_percent, 1.0);
    assert_eq!(detail.remaining_count, 0);
    assert_eq!(detail.avg_emissions_per_activity, 1.35);

    let progress = service.get_progress(&id).await.unwrap();
    assert_eq!(progress.processed_count, 10);
    assert!(progress.estimated_remaining_ms.is_none());

    scheduler.stop(Duration::from_secs(2)).await.unwrap();
    let stats = scheduler.get_stats();
    assert_eq!(stats.batches_processed, 1);
    assert_eq!(stats.successful_activities, 9);
    assert_eq!(stats.failed_activities, 1);
    println!("✅ DoD 1: 10-activity batch completed with 9 successes and 1 failure");
}

/// DoD 2: Higher priority batches are dispatched first
#[tokio::test]
async fn test_priority_order_with_single_worker() {
    let store = sqlite_store().await;
    let processor = Arc::new(MockActivityProcessor::new(MockBehavior::Delay {
        millis: 20,
        emissions: 1.0,
    }));
    let scheduler = scheduler(
        store.clone(),
        processor,
        SchedulerConfig {
            worker_pool_size: 1,
            polling_interval: Duration::from_secs(3600),
            ..fast_config()
        },
    );

    let now = SystemTimeProvider.now_millis();
    let mut low = BatchJob::new("batch_low", now, "org", "ws", 1, 3);
    low.priority = 1;
    let mut high = BatchJob::new("batch_high", now + 1, "org", "ws", 1, 3);
    high.priority = 9;
    for batch in [&low, &high] {
        store.create_batch(batch).await.unwrap();
        store.add_activity_ref(&batch.id, "a1").await.unwrap();
    }

    scheduler.start().unwrap();
    let high_done = wait_for_status(&store, "batch_high", JobStatus::Complete).await;
    let low_done = wait_for_status(&store, "batch_low", JobStatus::Complete).await;
    assert!(high_done.started_at <= low_done.started_at);

    scheduler.stop(Duration::from_secs(2)).await.unwrap();
    println!("✅ DoD 2: priority order respected");
}

/// DoD 3: Panic inside a batch marks it failed, the service retries it, budget runs out
#[tokio::test]
async fn test_panic_retry_and_exhaustion() {
    let store = sqlite_store().await;
    let processor = Arc::new(MockActivityProcessor::new_panic_inducing("emission factor table corrupt"));
    let scheduler = scheduler(
        store.clone(),
        processor,
        SchedulerConfig {
            auto_retry: false,
            ..fast_config()
        },
    );
    scheduler.start().unwrap();
    let service = BatchService::new(store.clone(), Arc::new(SystemTimeProvider));

    let id = scheduler
        .submit_batch("org", "ws", &activity_ids(2), Some(1))
        .await
        .unwrap();

    let failed = wait_for_status(&store, &id, JobStatus::Failed).await;
    assert!(failed
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("emission factor table corrupt"));

    let retried = service.retry_batch(&id).await.unwrap();
    assert_eq!(retried.retry_count, 1);

    let failed_again = wait_for_status(&store, &id, JobStatus::Failed).await;
    assert_eq!(failed_again.retry_count, 1);

    let err = service.retry_batch(&id).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    assert!(scheduler.health_check().status != HealthState::Stopped);
    scheduler.stop(Duration::from_secs(2)).await.unwrap();
    assert_eq!(scheduler.health_check().status, HealthState::Stopped);
    println!("✅ DoD 3: panic isolation + retry budget");
}

/// DoD 4: Auto-retry requeues a failed batch on the next poll
#[tokio::test]
async fn test_auto_retry_until_budget_spent() {
    let store = sqlite_store().await;
    let processor = Arc::new(MockActivityProcessor::new_panic_inducing("flaky"));
    let scheduler = scheduler(store.clone(), processor, fast_config());
    scheduler.start().unwrap();

    let id = scheduler
        .submit_batch("org", "ws", &activity_ids(1), Some(2))
        .await
        .unwrap();

    let mut final_state = None;
    for _ in 0..300 {
        let batch = store.get_batch(&id).await.unwrap().unwrap();
        if batch.status == JobStatus::Failed && batch.retry_count == 2 && batch.locked_by.is_none() {
            final_state = Some(batch);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let batch = final_state.expect("batch never exhausted its retries");
    assert!(!batch.can_retry());

    scheduler.stop(Duration::from_secs(2)).await.unwrap();
    assert!(scheduler.get_stats().batches_retried >= 2);
    println!("✅ DoD 4: automatic retries stop at max_retries");
}

/// DoD 5: stop() with a processor that ignores shutdown returns a timeout error
#[tokio::test]
async fn test_stop_timeout_with_hanging_processor() {
    let store = sqlite_store().await;
    let processor = Arc::new(MockActivityProcessor::new(MockBehavior::Hang));
    let scheduler = scheduler(store.clone(), processor.clone(), fast_config());
    scheduler.start().unwrap();

    scheduler
        .submit_batch("org", "ws", &activity_ids(1), Some(3))
        .await
        .unwrap();
    for _ in 0..200 {
        if processor.call_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = scheduler.stop(Duration::from_millis(300)).await.unwrap_err();
    assert!(matches!(err, AppError::ShutdownTimeout { waited_ms: 300 }));
    assert!(!scheduler.is_running());
    println!("✅ DoD 5: bounded shutdown");
}

/// DoD 7: A batch is never processed before all of its refs are stored
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fast_polling_during_large_submit() {
    let store = sqlite_store().await;
    let processor = Arc::new(MockActivityProcessor::new_success(0.5));
    let scheduler = scheduler(
        store.clone(),
        processor.clone(),
        SchedulerConfig {
            polling_interval: Duration::from_millis(1),
            jitter_range: Duration::ZERO,
            batch_timeout: Duration::from_secs(60),
            ..fast_config()
        },
    );
    scheduler.start().unwrap();

    let id = scheduler
        .submit_batch("org", "ws", &activity_ids(1000), Some(3))
        .await
        .unwrap();

    let mut done = None;
    for _ in 0..3000 {
        let batch = store.get_batch(&id).await.unwrap().unwrap();
        if batch.status == JobStatus::Complete && batch.locked_by.is_none() {
            done = Some(batch);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let batch = done.expect("large batch never completed");
    assert_eq!(batch.success_count, 1000);
    assert_eq!(batch.error_count, 0);
    assert_eq!(batch.total_emissions, 500.0);

    let refs = store.get_activity_refs(&id).await.unwrap();
    assert!(refs.iter().all(|r| r.status == ActivityStatus::Complete));

    scheduler.stop(Duration::from_secs(5)).await.unwrap();
    println!("✅ DoD 7: no partial batch visible while refs are written");
}

/// DoD 6: Real calculator subprocess end to end
#[cfg(unix)]
#[tokio::test]
async fn test_subprocess_calculator_end_to_end() {
    use carbonbatch_infra_system::{SubprocessActivityProcessor, SubprocessConfig};

    let store = sqlite_store().await;
    let config = SubprocessConfig::new("sh").with_args([
        "-c",
        r#"printf '{"emissions": 0.25, "metadata": {"activity": "%s"}}' "$CARBONBATCH_ACTIVITY_ID""#,
    ]);
    let processor = Arc::new(SubprocessActivityProcessor::new(
        config,
        Arc::new(SystemTimeProvider),
    ));
    let scheduler = scheduler(store.clone(), processor, fast_config());
    scheduler.start().unwrap();

    let id = scheduler
        .submit_batch("org", "ws", &activity_ids(4), Some(3))
        .await
        .unwrap();
    let batch = wait_for_status(&store, &id, JobStatus::Complete).await;
    assert_eq!(batch.success_count, 4);
    assert_eq!(batch.total_emissions, 1.0);

    let refs = store.get_activity_refs(&id).await.unwrap();
    for r in &refs {
        assert_eq!(
            r.metadata,
            Some(serde_json::json!({"activity": r.activity_id}))
        );
    }

    scheduler.stop(Duration::from_secs(2)).await.unwrap();
    println!("✅ DoD 6: subprocess calculator wired through the scheduler");
}
