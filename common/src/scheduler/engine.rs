// Scheduler tick loop
// Launches runs for tasks whose cron schedules fired since the previous tick

use crate::catalog::CatalogRepository;
use crate::config::SchedulerConfig;
use crate::engine::TaskEngine;
use crate::errors::CatalogError;
use crate::models::Task;
use crate::schedule::{fired_between, parse_cron_expression};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Polls the catalog and hands due tasks to the engine
///
/// A tick only spawns runs; it never waits for one to finish.
pub struct SchedulerEngine {
    config: SchedulerConfig,
    engine: Arc<TaskEngine>,
    catalog: Arc<dyn CatalogRepository>,
    last_tick: Mutex<DateTime<Utc>>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl SchedulerEngine {
    pub fn new(config: SchedulerConfig, engine: Arc<TaskEngine>) -> Self {
        let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);
        let catalog = Arc::clone(engine.catalog());

        Self {
            config,
            engine,
            catalog,
            last_tick: Mutex::new(Utc::now()),
            shutdown_tx,
        }
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Run the polling loop until `stop` is called
    #[instrument(skip(self))]
    pub async fn start(&self) {
        info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            "Starting scheduler"
        );

        let mut poll_interval = interval(Duration::from_secs(self.config.poll_interval_seconds));
        let mut shutdown_rx = self.shutdown_receiver();

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(runs) if !runs.is_empty() => info!(runs = runs.len(), "Launched due tasks"),
                        Ok(_) => debug!("No tasks due"),
                        Err(e) => error!(error = %e, "Failed to load tasks from catalog"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Signal the polling loop to exit; runs already launched continue
    pub fn stop(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Scheduler was not running");
        }
    }

    /// Launch every active task with a schedule that fired in `(previous tick, now]`
    ///
    /// Returns the run ids spawned. A task is launched at most once per tick
    /// even if several of its schedules fired.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, CatalogError> {
        let since = {
            let mut last_tick = self.last_tick.lock().await;
            let since = *last_tick;
            if now <= since {
                return Ok(Vec::new());
            }
            *last_tick = now;
            since
        };

        let tasks = self.catalog.get_active_tasks().await?;
        let mut launched = Vec::new();
        for task in tasks {
            if !is_due(&task, since, now) {
                continue;
            }
            let (run_id, _handle) = self.engine.spawn(task.clone());
            info!(task_id = task.id, task_name = %task.name, run_id = %run_id, "Task run launched");
            launched.push(run_id);
        }
        Ok(launched)
    }
}

fn is_due(task: &Task, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    task.schedules.iter().filter(|s| s.active).any(|schedule| {
        match parse_cron_expression(&schedule.cron) {
            Ok(cron) => fired_between(&cron, since, now),
            Err(e) => {
                warn!(task_id = task.id, schedule_id = schedule.id, error = %e, "Skipping invalid schedule");
                false
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, InMemoryAuditLog};
    use crate::catalog::InMemoryCatalog;
    use crate::errors::PluginError;
    use crate::models::{RunStatus, Schedule, Step};
    use crate::plugins::{MailMessage, Mailer, PluginRegistry};
    use crate::protocol::Timeouts;
    use crate::staging::StagingArea;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct NullMailer;

    #[async_trait]
    impl Mailer for NullMailer {
        async fn send(&self, _message: MailMessage) -> Result<(), PluginError> {
            Ok(())
        }
    }

    fn task(id: i64, cron: &str, active: bool) -> Task {
        Task {
            id,
            name: format!("task{}", id),
            description: None,
            active,
            steps: vec![Step {
                id: id * 10,
                task_id: id,
                name: None,
                sort_order: 1,
                script: "workspace_create".to_string(),
                arguments: "{}".to_string(),
                host_id: None,
                active: true,
            }],
            schedules: vec![
                Schedule {
                    id: 1,
                    task_id: id,
                    cron: cron.to_string(),
                    active: true,
                },
                Schedule {
                    id: 2,
                    task_id: id,
                    cron: "not a cron".to_string(),
                    active: true,
                },
            ],
        }
    }

    fn scheduler(work: &std::path::Path, tasks: Vec<Task>) -> (SchedulerEngine, Arc<InMemoryAuditLog>) {
        let audit = Arc::new(InMemoryAuditLog::new());
        let engine = Arc::new(TaskEngine::new(
            audit.clone(),
            Arc::new(InMemoryCatalog::new(Vec::new(), tasks).unwrap()),
            Arc::new(PluginRegistry::with_defaults()),
            StagingArea::new(work),
            Arc::new(NullMailer),
            Timeouts::default(),
        ));
        (SchedulerEngine::new(SchedulerConfig::default(), engine), audit)
    }

    #[test]
    fn test_is_due_ignores_invalid_and_inactive_schedules() {
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 1, 59, 30).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();

        let mut due = task(1, "0 2 * * *", true);
        assert!(is_due(&due, since, now));

        due.schedules[0].active = false;
        assert!(!is_due(&due, since, now));

        let later = task(2, "0 3 * * *", true);
        assert!(!is_due(&later, since, now));
    }

    #[tokio::test]
    async fn test_tick_launches_due_active_tasks_once() {
        let work = tempfile::tempdir().unwrap();
        let (scheduler, audit) = scheduler(
            work.path(),
            vec![
                task(1, "* * * * * *", true),
                task(2, "* * * * * *", false),
                task(3, "0 0 0 1 1 * 2099", true),
            ],
        );

        let now = Utc::now() + chrono::Duration::seconds(2);
        let launched = scheduler.tick(now).await.unwrap();
        assert_eq!(launched.len(), 1);

        // Same instant again: nothing new fired
        assert!(scheduler.tick(now).await.unwrap().is_empty());

        // Wait for the detached run to finish
        let run_id = launched[0];
        for _ in 0..100 {
            if let Some(run) = audit.task_run(run_id).await.unwrap() {
                if run.status.is_terminal() {
                    assert_eq!(run.status, RunStatus::Success);
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run {} did not finish", run_id);
    }

    #[tokio::test]
    async fn test_stop_ends_loop() {
        let work = tempfile::tempdir().unwrap();
        let (scheduler, _audit) = scheduler(work.path(), Vec::new());
        let scheduler = Arc::new(scheduler);

        let running = Arc::clone(&scheduler);
        let handle = tokio::spawn(async move { running.start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
