// Task execution engine
// Runs a task's steps in order inside an isolated staging directory and
// records the run, step and file audit trail

use crate::audit::AuditLog;
use crate::catalog::CatalogRepository;
use crate::errors::{EngineError, PluginError};
use crate::models::{RunStatus, Step, Task, TaskRun};
use crate::plugins::{Mailer, PluginContext, PluginRegistry};
use crate::protocol::Timeouts;
use crate::staging::{StagingArea, Teardown};
use crate::substitution::{self, Variables};
use crate::telemetry;
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Executes task runs
///
/// Cheap to share behind an `Arc`; concurrent runs only share the audit log
/// and the staging root, which is partitioned by run id.
pub struct TaskEngine {
    audit: Arc<dyn AuditLog>,
    catalog: Arc<dyn CatalogRepository>,
    registry: Arc<PluginRegistry>,
    staging: StagingArea,
    mailer: Arc<dyn Mailer>,
    timeouts: Timeouts,
    active_runs: Arc<AtomicUsize>,
}

/// Counts one run as active until dropped, including when the run unwinds
struct ActiveRun {
    active: Arc<AtomicUsize>,
}

impl ActiveRun {
    fn enter(active: &Arc<AtomicUsize>) -> Self {
        let count = active.fetch_add(1, Ordering::SeqCst) + 1;
        telemetry::set_active_runs(count);
        Self {
            active: Arc::clone(active),
        }
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        let count = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        telemetry::set_active_runs(count);
    }
}

impl TaskEngine {
    pub fn new(
        audit: Arc<dyn AuditLog>,
        catalog: Arc<dyn CatalogRepository>,
        registry: Arc<PluginRegistry>,
        staging: StagingArea,
        mailer: Arc<dyn Mailer>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            audit,
            catalog,
            registry,
            staging,
            mailer,
            timeouts,
            active_runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Runs started and not yet finished
    pub fn active_runs(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogRepository> {
        &self.catalog
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Run a task once under a fresh run id
    pub async fn execute(&self, task: &Task) -> Result<TaskRun, EngineError> {
        self.execute_with_id(Uuid::new_v4(), task).await
    }

    /// Look a task up in the catalog and run it
    pub async fn execute_by_id(&self, task_id: i64) -> Result<TaskRun, EngineError> {
        let task = self.catalog.get_task(task_id).await?;
        self.execute(&task).await
    }

    /// Run a task under `run_id`
    ///
    /// Step failures never surface as `Err`: they end the run with status
    /// `error` and are reported in the returned row. `Err` means the audit log
    /// itself could not be written.
    #[instrument(skip(self, task), fields(task_id = task.id, task_name = %task.name))]
    pub async fn execute_with_id(&self, run_id: Uuid, task: &Task) -> Result<TaskRun, EngineError> {
        info!(steps = task.steps.len(), "Starting task run");
        self.audit.start_task(run_id, task.id).await?;
        let _active = ActiveRun::enter(&self.active_runs);

        let outcome = match self.staging.create(&run_id).await {
            Ok(staging_dir) => {
                let outcome = self.run_steps(run_id, task, &staging_dir).await;
                match self.staging.teardown(&staging_dir, outcome.is_err()).await {
                    Ok(Teardown::Kept { residual_files }) => warn!(
                        path = %staging_dir.display(),
                        residual_files = residual_files,
                        "Staging directory kept after failed run"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Failed to remove staging directory"),
                }
                outcome
            }
            Err(e) => Err(EngineError::Staging(e)),
        };

        let (status, message) = match &outcome {
            Ok(()) => (RunStatus::Success, None),
            Err(e) => {
                error!(error = %e, "Task run failed");
                (RunStatus::Error, Some(e.to_string()))
            }
        };

        let run = self.audit.finish_task(run_id, task.id, status, message).await?;

        telemetry::record_task_run(&task.name, run.status, run.duration_sec.unwrap_or(0.0));
        info!(
            status = %run.status,
            duration_sec = run.duration_sec.unwrap_or(0.0),
            "Task run finished"
        );
        Ok(run)
    }

    /// Run a task on its own worker thread and return immediately
    ///
    /// Transfer backends block on network I/O, so each run drives its future
    /// on a thread from the blocking pool and never occupies a runtime worker.
    /// A panic that escapes the run is recorded as a terminal `error` row.
    pub fn spawn(self: &Arc<Self>, task: Task) -> (Uuid, JoinHandle<Result<TaskRun, EngineError>>) {
        let run_id = Uuid::new_v4();
        let engine = Arc::clone(self);
        let runtime = Handle::current();

        let handle = tokio::task::spawn_blocking(move || {
            runtime.block_on(async move {
                let run = AssertUnwindSafe(engine.execute_with_id(run_id, &task))
                    .catch_unwind()
                    .await;
                match run {
                    Ok(result) => result,
                    Err(panic) => {
                        let err = EngineError::Panicked(panic_message(panic.as_ref()));
                        error!(run_id = %run_id, task_id = task.id, error = %err, "Task run panicked");
                        engine
                            .audit
                            .finish_task(run_id, task.id, RunStatus::Error, Some(err.to_string()))
                            .await
                            .map_err(EngineError::from)
                    }
                }
            })
        });

        (run_id, handle)
    }

    /// Steps in ascending sort order; the first failure stops the run
    async fn run_steps(&self, run_id: Uuid, task: &Task, staging_dir: &Path) -> Result<(), EngineError> {
        let mut variables = Variables::new();
        variables.insert("task_id".to_string(), json!(task.id));
        variables.insert("task_name".to_string(), json!(task.name));
        variables.insert("workspace_id".to_string(), json!(run_id.to_string()));
        variables.insert(
            "workspace_directory".to_string(),
            json!(staging_dir.display().to_string()),
        );

        let mut steps: Vec<&Step> = task.steps.iter().collect();
        steps.sort_by_key(|s| (s.sort_order, s.id));

        for step in steps {
            if !step.active {
                info!(step_id = step.id, step = %step.label(), "Skipping inactive step");
                continue;
            }

            self.audit.start_step(run_id, task.id, step.id).await?;

            if !self.registry.contains(&step.script) {
                let err = EngineError::PluginNotFound(step.script.clone());
                error!(step_id = step.id, error = %err, "Cannot resolve step plugin");
                self.audit
                    .finish_step(run_id, task.id, step.id, RunStatus::Error, Some(err.to_string()))
                    .await?;
                return Err(err);
            }

            let result = self.run_step(run_id, task, step, staging_dir, &mut variables).await;

            match result {
                Ok(()) => {
                    self.audit
                        .finish_step(run_id, task.id, step.id, RunStatus::Success, None)
                        .await?;
                    info!(step_id = step.id, step = %step.label(), "Step completed");
                }
                Err(e) => {
                    error!(step_id = step.id, step = %step.label(), error = %e, "Step failed");
                    self.audit
                        .finish_step(run_id, task.id, step.id, RunStatus::Error, Some(e.to_string()))
                        .await?;
                    return Err(EngineError::StepFailed {
                        step_id: step.id,
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Resolve the host, render arguments, build the plugin and invoke it
    #[instrument(skip_all, fields(run_id = %run_id, step_id = step.id, script = %step.script))]
    async fn run_step(
        &self,
        run_id: Uuid,
        task: &Task,
        step: &Step,
        staging_dir: &Path,
        variables: &mut Variables,
    ) -> Result<(), PluginError> {
        let host = match step.host_id {
            Some(host_id) => Some(
                self.catalog
                    .get_host(host_id)
                    .await
                    .map_err(|e| PluginError::Configuration(e.to_string()))?,
            ),
            None => None,
        };

        variables.insert("step_id".to_string(), json!(step.id));
        match &host {
            Some(host) => {
                variables.insert("host_id".to_string(), json!(host.id));
                variables.insert("host_name".to_string(), json!(host.name));
            }
            None => {
                variables.remove("host_id");
                variables.remove("host_name");
            }
        }

        let arguments = substitution::render(&step.arguments, variables)?;
        let plugin = self.registry.create(&step.script, &arguments)?;

        let mut ctx = PluginContext {
            run_id,
            task_id: task.id,
            step_id: step.id,
            host,
            staging_dir: staging_dir.to_path_buf(),
            variables: std::mem::take(variables),
            audit: Arc::clone(&self.audit),
            mailer: Arc::clone(&self.mailer),
            timeouts: self.timeouts,
        };

        let result = AssertUnwindSafe(plugin.process(&mut ctx)).catch_unwind().await;
        *variables = ctx.variables;

        match result {
            Ok(result) => result,
            Err(panic) => Err(PluginError::Panicked {
                plugin: plugin.name().to_string(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::catalog::InMemoryCatalog;
    use crate::errors::CatalogError;
    use crate::models::{FileStatus, Host, HostKind};
    use crate::plugins::{MailMessage, Plugin};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullMailer;

    #[async_trait]
    impl Mailer for NullMailer {
        async fn send(&self, _message: MailMessage) -> Result<(), PluginError> {
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl Plugin for Panics {
        fn name(&self) -> &'static str {
            "panics"
        }

        async fn process(&self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
            panic!("boom")
        }
    }

    /// Writes a file into the workspace and then fails
    struct StagesThenFails;

    #[async_trait]
    impl Plugin for StagesThenFails {
        fn name(&self) -> &'static str {
            "stages_then_fails"
        }

        async fn process(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
            tokio::fs::write(ctx.staging_dir.join("partial.dat"), b"x")
                .await
                .map_err(|e| PluginError::Configuration(e.to_string()))?;
            Err(PluginError::Configuration("failed after staging".to_string()))
        }
    }

    /// Serves one task and panics on any host lookup
    struct PanickingHosts {
        task: Task,
    }

    #[async_trait]
    impl CatalogRepository for PanickingHosts {
        async fn get_task(&self, _task_id: i64) -> Result<Task, CatalogError> {
            Ok(self.task.clone())
        }

        async fn get_active_tasks(&self) -> Result<Vec<Task>, CatalogError> {
            Ok(vec![self.task.clone()])
        }

        async fn get_host(&self, _host_id: i64) -> Result<Host, CatalogError> {
            panic!("host table unavailable")
        }
    }

    fn host(id: i64, dir: &Path) -> Host {
        Host {
            id,
            name: format!("dir{}", id),
            kind: HostKind::LocalDirectory,
            host: None,
            port: None,
            directory: Some(dir.display().to_string()),
            share: None,
            username: None,
            password: None,
            description: None,
        }
    }

    fn step(id: i64, sort_order: i32, script: &str, arguments: &str, host_id: Option<i64>) -> Step {
        Step {
            id,
            task_id: 1,
            name: None,
            sort_order,
            script: script.to_string(),
            arguments: arguments.to_string(),
            host_id,
            active: true,
        }
    }

    fn task(steps: Vec<Step>) -> Task {
        Task {
            id: 1,
            name: "copy".to_string(),
            description: None,
            active: true,
            steps,
            schedules: Vec::new(),
        }
    }

    fn engine(work: &Path, hosts: Vec<Host>) -> (TaskEngine, Arc<InMemoryAuditLog>) {
        engine_with(
            work,
            Arc::new(InMemoryCatalog::new(hosts, Vec::new()).unwrap()),
            Timeouts::default(),
        )
    }

    fn engine_with(
        work: &Path,
        catalog: Arc<dyn CatalogRepository>,
        timeouts: Timeouts,
    ) -> (TaskEngine, Arc<InMemoryAuditLog>) {
        let audit = Arc::new(InMemoryAuditLog::new());
        let mut registry = PluginRegistry::with_defaults();
        registry.register("panics", "", |_| Ok(Box::new(Panics) as Box<dyn Plugin>));
        registry.register("stages_then_fails", "", |_| {
            Ok(Box::new(StagesThenFails) as Box<dyn Plugin>)
        });
        let engine = TaskEngine::new(
            audit.clone(),
            catalog,
            Arc::new(registry),
            StagingArea::new(work),
            Arc::new(NullMailer),
            timeouts,
        );
        (engine, audit)
    }

    #[tokio::test]
    async fn test_download_then_upload() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("report.txt"), b"report").unwrap();
        std::fs::write(source.path().join("notes.csv"), b"notes").unwrap();

        let (engine, audit) = engine(
            work.path(),
            vec![host(1, source.path()), host(2, target.path())],
        );
        let task = task(vec![
            step(1, 1, "local_directory_download_files", r#"{"file_filter": "*.txt"}"#, Some(1)),
            step(2, 2, "local_directory_upload_files", "{}", Some(2)),
        ]);

        let run = engine.execute(&task).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(target.path().join("report.txt").exists());
        assert!(!target.path().join("notes.csv").exists());

        let steps = audit.step_runs(run.run_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.status == RunStatus::Success));

        let events = audit.file_events(run.run_id).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.status == FileStatus::Downloaded).count(), 1);
        assert_eq!(events.iter().filter(|e| e.status == FileStatus::Uploaded).count(), 1);

        // Successful run leaves no staging directory behind
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_steps_run_in_sort_order_not_list_order() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("report.txt"), b"report").unwrap();

        let (engine, audit) = engine(
            work.path(),
            vec![host(1, source.path()), host(2, target.path())],
        );
        // Built directly, bypassing the catalog's own ordering
        let task = task(vec![
            step(2, 2, "local_directory_upload_files", "{}", Some(2)),
            step(1, 1, "local_directory_download_files", "{}", Some(1)),
        ]);

        let run = engine.execute(&task).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(target.path().join("report.txt").exists());

        let order: Vec<i64> = audit
            .step_runs(run.run_id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.step_id)
            .collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_missing_plugin_stops_run() {
        let work = tempfile::tempdir().unwrap();
        let (engine, audit) = engine(work.path(), Vec::new());
        let task = task(vec![
            step(1, 1, "nonexistent_plugin", "{}", None),
            step(2, 2, "workspace_create", "{}", None),
        ]);

        let run = engine.execute(&task).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.message.unwrap().contains("nonexistent_plugin"));

        let steps = audit.step_runs(run.run_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_id, 1);
        assert!(audit.file_events(run.run_id).await.unwrap().is_empty());
        // Empty workspace is cleaned up even on error
        assert!(!engine.staging().path_for(&run.run_id).exists());
    }

    #[tokio::test]
    async fn test_inactive_steps_are_skipped() {
        let work = tempfile::tempdir().unwrap();
        let (engine, audit) = engine(work.path(), Vec::new());
        let mut skipped = step(1, 1, "nonexistent_plugin", "{}", None);
        skipped.active = false;
        let task = task(vec![skipped, step(2, 2, "workspace_create", "{}", None)]);

        let run = engine.execute(&task).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(audit.step_runs(run.run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_run_keeps_staged_files() {
        let work = tempfile::tempdir().unwrap();
        let (engine, _audit) = engine(work.path(), Vec::new());
        let task = task(vec![step(1, 1, "stages_then_fails", "{}", None)]);

        let run = engine.execute(&task).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        let staging_dir = engine.staging().path_for(&run.run_id);
        assert!(staging_dir.join("partial.dat").exists());
    }

    #[tokio::test]
    async fn test_arguments_rendered_from_earlier_outputs() {
        let source = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), b"a").unwrap();

        let (engine, _audit) = engine(work.path(), vec![host(1, source.path())]);
        let task = task(vec![
            step(1, 1, "local_directory_list_files", "{}", Some(1)),
            // A list is not a valid filter, so the rendered document is rejected
            step(2, 2, "local_directory_download_files", r#"{"file_filter": {{ matched_files }}}"#, Some(1)),
        ]);

        let run = engine.execute(&task).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.message.unwrap().contains("Step 2"));
    }

    #[tokio::test]
    async fn test_undefined_template_variable_fails_step() {
        let work = tempfile::tempdir().unwrap();
        let (engine, audit) = engine(work.path(), Vec::new());
        let task = task(vec![step(1, 1, "workspace_rename_files", r#"{"filename": {{ missing }}}"#, None)]);

        let run = engine.execute(&task).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        let steps = audit.step_runs(run.run_id).await.unwrap();
        assert!(steps[0].message.as_deref().unwrap_or("").contains("missing"));
    }

    #[tokio::test]
    async fn test_unknown_host_fails_step() {
        let work = tempfile::tempdir().unwrap();
        let (engine, _audit) = engine(work.path(), Vec::new());
        let task = task(vec![step(1, 1, "local_directory_list_files", "{}", Some(42))]);

        let run = engine.execute(&task).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_plugin_panic_is_contained() {
        let work = tempfile::tempdir().unwrap();
        let (engine, audit) = engine(work.path(), Vec::new());
        let engine = Arc::new(engine);

        let (run_id, handle) = engine.spawn(task(vec![step(1, 1, "panics", "{}", None)]));
        let run = handle.await.unwrap().unwrap();

        assert_eq!(run.run_id, run_id);
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.message.unwrap().contains("boom"));
        let stored = audit.task_run(run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Error);

        let steps = audit.step_runs(run_id).await.unwrap();
        assert!(steps[0]
            .message
            .as_deref()
            .unwrap_or("")
            .contains("Plugin 'panics' panicked: boom"));
        assert_eq!(engine.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_plugin_panic_is_reported_as_panic() {
        let work = tempfile::tempdir().unwrap();
        let (engine, _audit) = engine(work.path(), Vec::new());
        let task = task(vec![step(1, 1, "panics", "{}", None)]);

        let step = &task.steps[0];
        let mut variables = Variables::new();
        let result = engine
            .run_step(Uuid::new_v4(), &task, step, work.path(), &mut variables)
            .await;
        assert!(matches!(
            result,
            Err(PluginError::Panicked { ref plugin, ref message }) if plugin == "panics" && message == "boom"
        ));
    }

    #[tokio::test]
    async fn test_run_panic_outside_plugin_releases_active_count() {
        let work = tempfile::tempdir().unwrap();
        let task = task(vec![step(1, 1, "local_directory_list_files", "{}", Some(1))]);
        let catalog = Arc::new(PanickingHosts { task: task.clone() });
        let (engine, audit) = engine_with(work.path(), catalog, Timeouts::default());
        let engine = Arc::new(engine);

        let (run_id, handle) = engine.spawn(task);
        let run = handle.await.unwrap().unwrap();

        assert_eq!(run.status, RunStatus::Error);
        assert!(run
            .message
            .unwrap()
            .contains("Run worker panicked: host table unavailable"));
        assert_eq!(audit.task_run(run_id).await.unwrap().unwrap().status, RunStatus::Error);
        assert_eq!(engine.active_runs(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocked_transfer_leaves_runtime_responsive() {
        // Completes TCP connects through the backlog but never speaks SSH
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();

        let work = tempfile::tempdir().unwrap();
        let mut sftp = host(1, work.path());
        sftp.kind = HostKind::Sftp;
        sftp.host = Some("127.0.0.1".to_string());
        sftp.port = Some(port);
        sftp.directory = None;
        sftp.username = Some("user".to_string());
        sftp.password = Some("secret".to_string());

        let timeouts = Timeouts {
            connect: Duration::from_secs(2),
            io: Duration::from_secs(2),
        };
        let catalog = Arc::new(InMemoryCatalog::new(vec![sftp], Vec::new()).unwrap());
        let (engine, _audit) = engine_with(work.path(), catalog, timeouts);
        let engine = Arc::new(engine);

        let (_run_id, handle) =
            engine.spawn(task(vec![step(1, 1, "sftp_list_files", "{}", Some(1))]));

        // Shares the single runtime worker with whatever the run occupies
        let ticker = tokio::spawn(async {
            let mut interval = tokio::time::interval(Duration::from_millis(50));
            for _ in 0..10 {
                interval.tick().await;
            }
        });
        assert!(tokio::time::timeout(Duration::from_secs(1), ticker).await.is_ok());

        let run = handle.await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        drop(silent);
    }

    #[tokio::test]
    async fn test_duration_matches_timestamps() {
        let work = tempfile::tempdir().unwrap();
        let (engine, _audit) = engine(work.path(), Vec::new());
        let run = engine
            .execute(&task(vec![step(1, 1, "workspace_create", "{}", None)]))
            .await
            .unwrap();

        let end = run.end_time.unwrap();
        assert!(end >= run.start_time);
        let expected = crate::models::duration_between(run.start_time, end);
        assert!((run.duration_sec.unwrap() - expected).abs() < 1e-6);
    }
}
