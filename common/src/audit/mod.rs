// Audit log writer
// Task-run, step-run and per-file rows consumed by the engine and the reporting surface

pub mod format;
pub mod memory;
pub mod postgres;

pub use format::human_bytes;
pub use memory::InMemoryAuditLog;
pub use postgres::PostgresAuditLog;

use crate::errors::AuditError;
use crate::models::{FileEvent, FileRecord, FileStatus, RunStatus, StepRun, TaskRun};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A file event about to be appended
#[derive(Debug, Clone)]
pub struct NewFileEvent {
    pub run_id: Uuid,
    pub task_id: i64,
    pub step_id: i64,
    pub file_id: Uuid,
    pub file_name: String,
    pub size: Option<u64>,
    pub status: FileStatus,
}

impl NewFileEvent {
    pub fn new(
        run_id: Uuid,
        task_id: i64,
        step_id: i64,
        file: &FileRecord,
        status: FileStatus,
    ) -> Self {
        Self {
            run_id,
            task_id,
            step_id,
            file_id: file.file_id,
            file_name: file.name.clone(),
            size: file.size,
            status,
        }
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }
}

/// Storage for the audit trail
///
/// Rows are scoped by run id (and step id), so concurrent runs never touch
/// each other's rows. Start calls are idempotent and finish calls perform at
/// most one terminal transition.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Insert a running task row; no-op if the run id already has one
    async fn start_task(&self, run_id: Uuid, task_id: i64) -> Result<(), AuditError>;

    /// Mark the run terminal with end time and duration
    ///
    /// Inserts a terminal row if `start_task` was never recorded. A second call
    /// for an already terminal run returns the existing row unchanged.
    async fn finish_task(
        &self,
        run_id: Uuid,
        task_id: i64,
        status: RunStatus,
        message: Option<String>,
    ) -> Result<TaskRun, AuditError>;

    /// Insert a running step row; no-op if one exists for (run id, step id)
    async fn start_step(&self, run_id: Uuid, task_id: i64, step_id: i64)
        -> Result<(), AuditError>;

    /// Step counterpart of `finish_task`
    async fn finish_step(
        &self,
        run_id: Uuid,
        task_id: i64,
        step_id: i64,
        status: RunStatus,
        message: Option<String>,
    ) -> Result<StepRun, AuditError>;

    /// Append a file event
    ///
    /// Completion statuses look up the matching in-flight row for the same
    /// file id to fill duration and throughput; without one both stay unset.
    async fn record_file_event(&self, event: NewFileEvent) -> Result<FileEvent, AuditError>;

    /// Most recent task runs first
    async fn task_runs(&self, limit: usize) -> Result<Vec<TaskRun>, AuditError>;

    async fn task_run(&self, run_id: Uuid) -> Result<Option<TaskRun>, AuditError>;

    /// Step runs of one task run, in start order
    async fn step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, AuditError>;

    /// File events of one task run, in insertion order
    async fn file_events(&self, run_id: Uuid) -> Result<Vec<FileEvent>, AuditError>;

    /// Latest event per (run, step, file), most recent first
    async fn latest_file_events(&self, limit: usize) -> Result<Vec<FileEvent>, AuditError>;
}

/// Duration and throughput for a completion event started at `started`
pub(crate) fn completion_metrics(
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
    size: Option<u64>,
) -> (Option<f64>, Option<f64>) {
    let duration = crate::models::duration_between(started, finished).max(0.0);
    let throughput = match size {
        Some(bytes) if duration > 0.0 => Some(bytes as f64 / duration),
        _ => None,
    };
    (Some(duration), throughput)
}
