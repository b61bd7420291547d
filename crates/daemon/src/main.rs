//! CarbonBatch - scheduler daemon
//! Wires the SQLite (or in-memory) store, the calculator subprocess and the
//! batch scheduler, then runs until Ctrl+C.

mod settings;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use carbonbatch_core::application::{
    shutdown_channel, BackoffPolicy, BatchScheduler, MaintenanceScheduler,
};
use carbonbatch_core::port::{
    BatchStore, InMemoryBatchStore, Maintenance, RandomBatchIdProvider, SystemTimeProvider,
    TimeProvider,
};
use carbonbatch_infra_sqlite::{create_pool, run_migrations, SqliteBatchStore, SqliteMaintenance};
use carbonbatch_infra_system::SubprocessActivityProcessor;
use settings::{DatabaseSettings, LogFormat, LoggingSettings, Settings, StoreBackend};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration, then logging (the filter comes from settings)
    let settings = Settings::load().context("Failed to load configuration")?;
    let _log_guard = init_tracing(&settings.logging)?;

    info!("CarbonBatch scheduler v{} starting...", VERSION);

    // 2. Store
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let (store, maintenance) = open_store(&settings.database, time_provider.clone()).await?;

    // 3. Scheduler
    let processor = Arc::new(SubprocessActivityProcessor::new(
        settings.processor.to_config(),
        time_provider.clone(),
    ));
    let scheduler = BatchScheduler::new(
        store,
        processor,
        time_provider,
        Arc::new(RandomBatchIdProvider),
        settings.scheduler.to_config(),
    )
    .context("Invalid scheduler configuration")?;

    scheduler.start().context("Scheduler start failed")?;

    // 4. Maintenance
    let (maintenance_tx, maintenance_token) = shutdown_channel();
    let maintenance_handle = if settings.maintenance.enabled {
        info!("Starting maintenance scheduler...");
        let maintenance_scheduler = MaintenanceScheduler::new(
            maintenance,
            settings.maintenance.to_config(),
            settings.maintenance.interval(),
            BackoffPolicy::default(),
        );
        Some(tokio::spawn(maintenance_scheduler.run(maintenance_token)))
    } else {
        None
    };

    info!(
        instance_id = %scheduler.instance_id(),
        command = %settings.processor.command,
        "System ready. Waiting for batches..."
    );
    info!("Press Ctrl+C to shutdown");

    // 5. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received. Stopping scheduler...");

    // 6. Graceful shutdown
    if let Err(e) = scheduler.stop(settings.scheduler.shutdown_timeout()).await {
        warn!(error = %e, "Scheduler did not stop cleanly; unfinished batches are reclaimed after their lock expires");
    }

    maintenance_tx.shutdown();
    if let Some(handle) = maintenance_handle {
        if tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            warn!("Maintenance scheduler did not stop within 5s");
        }
    }

    let stats = scheduler.get_stats();
    info!(
        batches_processed = stats.batches_processed,
        batches_failed = stats.batches_failed,
        total_emissions = stats.total_emissions,
        "Shutdown complete."
    );

    Ok(())
}

/// Install the global subscriber. The returned guard flushes the file sink on drop.
fn init_tracing(logging: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .context("Invalid log filter")?;

    let (file_layer, guard) = match &logging.directory {
        Some(dir) => {
            let dir = shellexpand::tilde(dir).into_owned();
            let appender = tracing_appender::rolling::daily(dir, "carbonbatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    match logging.format {
        // Production: JSON structured logging
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        // Development: Pretty formatting with colors
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
    }
    .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

async fn open_store(
    database: &DatabaseSettings,
    time_provider: Arc<dyn TimeProvider>,
) -> Result<(Arc<dyn BatchStore>, Arc<dyn Maintenance>)> {
    match database.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store: batches are lost on restart");
            let memory = Arc::new(InMemoryBatchStore::with_time_provider(time_provider));
            let store: Arc<dyn BatchStore> = memory.clone();
            let maintenance: Arc<dyn Maintenance> = memory;
            Ok((store, maintenance))
        }
        StoreBackend::Sqlite => {
            if let Some(parent) = database.file_path().as_deref().and_then(|p| p.parent()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }

            let url = database.url();
            info!(url = %url, "Initializing database...");

            let pool = create_pool(&url, database.max_connections)
                .await
                .context("DB pool creation failed")?;
            run_migrations(&pool).await.context("Migration failed")?;

            let store: Arc<dyn BatchStore> =
                Arc::new(SqliteBatchStore::new(pool.clone(), time_provider.clone()));
            let maintenance: Arc<dyn Maintenance> =
                Arc::new(SqliteMaintenance::new(pool, time_provider));
            Ok((store, maintenance))
        }
    }
}
