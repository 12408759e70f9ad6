// Worker binary entry point
// Runs scheduled file-transfer tasks until Ctrl+C

use anyhow::{Context, Result};
use common::audit::{AuditLog, InMemoryAuditLog, PostgresAuditLog};
use common::catalog::InMemoryCatalog;
use common::config::Settings;
use common::db::DbPool;
use common::engine::TaskEngine;
use common::plugins::{PluginRegistry, SmtpMailer};
use common::protocol::Timeouts;
use common::scheduler::SchedulerEngine;
use common::staging::StagingArea;
use common::telemetry::{init_logging, init_metrics};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    init_logging(&settings.observability.log_level)?;
    info!("Starting file transfer worker");

    if let Some(port) = settings.observability.metrics_port {
        init_metrics(port)?;
    }

    let (audit, db_pool) = open_audit_log(&settings).await?;

    let catalog = InMemoryCatalog::load(&settings.engine.catalog_path)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to load catalog");
            anyhow::anyhow!("Catalog error: {}", e)
        })?;

    let registry = PluginRegistry::with_defaults();
    info!(plugins = registry.len(), "Plugin registry initialized");

    tokio::fs::create_dir_all(&settings.engine.work_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create work directory {}",
                settings.engine.work_dir.display()
            )
        })?;

    let engine = Arc::new(TaskEngine::new(
        audit,
        Arc::new(catalog),
        Arc::new(registry),
        StagingArea::new(&settings.engine.work_dir),
        Arc::new(SmtpMailer::new(settings.smtp.clone())),
        Timeouts::from(&settings.transfer),
    ));

    let scheduler_handle = if settings.scheduler.enabled {
        let scheduler = Arc::new(SchedulerEngine::new(settings.scheduler.clone(), engine));
        let running = Arc::clone(&scheduler);
        let handle = tokio::spawn(async move { running.start().await });
        Some((scheduler, handle))
    } else {
        warn!("Scheduler disabled; no tasks will be launched");
        None
    };

    info!("Worker is running. Press Ctrl+C to shutdown gracefully");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, initiating graceful shutdown"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    if let Some((scheduler, handle)) = scheduler_handle {
        scheduler.stop();
        if let Err(e) = handle.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
    }

    if let Some(pool) = db_pool {
        pool.close().await;
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// Postgres when a database URL is configured, otherwise an in-memory log
async fn open_audit_log(settings: &Settings) -> Result<(Arc<dyn AuditLog>, Option<DbPool>)> {
    let Some(url) = settings.database.url.as_deref() else {
        warn!("No database configured, audit rows are kept in memory only");
        return Ok((Arc::new(InMemoryAuditLog::new()), None));
    };

    let pool = DbPool::new(url, &settings.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database pool");
        anyhow::anyhow!("Database initialization error: {}", e)
    })?;
    pool.migrate().await.map_err(|e| {
        error!(error = %e, "Failed to run audit migrations");
        anyhow::anyhow!("Migration error: {}", e)
    })?;
    info!("Audit database ready");

    Ok((Arc::new(PostgresAuditLog::new(pool.clone())), Some(pool)))
}
