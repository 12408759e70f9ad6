// In-process audit log store

use super::{completion_metrics, AuditLog, NewFileEvent};
use crate::errors::AuditError;
use crate::models::{duration_between, FileEvent, RunStatus, StepRun, TaskRun};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    task_runs: Vec<TaskRun>,
    step_runs: Vec<StepRun>,
    file_events: Vec<FileEvent>,
}

/// Audit log kept in memory, used when no database is configured and in tests
#[derive(Default)]
pub struct InMemoryAuditLog {
    tables: Mutex<Tables>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    #[instrument(skip(self))]
    async fn start_task(&self, run_id: Uuid, task_id: i64) -> Result<(), AuditError> {
        let mut tables = self.tables.lock().await;
        if tables.task_runs.iter().any(|r| r.run_id == run_id) {
            debug!(run_id = %run_id, "Task run already started");
            return Ok(());
        }
        tables.task_runs.push(TaskRun {
            run_id,
            task_id,
            start_time: Utc::now(),
            end_time: None,
            status: RunStatus::Running,
            duration_sec: None,
            message: None,
        });
        Ok(())
    }

    #[instrument(skip(self, message))]
    async fn finish_task(
        &self,
        run_id: Uuid,
        task_id: i64,
        status: RunStatus,
        message: Option<String>,
    ) -> Result<TaskRun, AuditError> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;

        if let Some(row) = tables.task_runs.iter_mut().find(|r| r.run_id == run_id) {
            if row.status.is_terminal() {
                debug!(run_id = %run_id, status = %row.status, "Task run already finished");
                return Ok(row.clone());
            }
            row.end_time = Some(now);
            row.status = status;
            row.duration_sec = Some(duration_between(row.start_time, now));
            row.message = message;
            return Ok(row.clone());
        }

        warn!(run_id = %run_id, "Finishing task run that was never started");
        let row = TaskRun {
            run_id,
            task_id,
            start_time: now,
            end_time: Some(now),
            status,
            duration_sec: Some(0.0),
            message,
        };
        tables.task_runs.push(row.clone());
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn start_step(
        &self,
        run_id: Uuid,
        task_id: i64,
        step_id: i64,
    ) -> Result<(), AuditError> {
        let mut tables = self.tables.lock().await;
        if tables
            .step_runs
            .iter()
            .any(|r| r.run_id == run_id && r.step_id == step_id)
        {
            return Ok(());
        }
        tables.step_runs.push(StepRun {
            run_id,
            task_id,
            step_id,
            start_time: Utc::now(),
            end_time: None,
            status: RunStatus::Running,
            duration_sec: None,
            message: None,
        });
        Ok(())
    }

    #[instrument(skip(self, message))]
    async fn finish_step(
        &self,
        run_id: Uuid,
        task_id: i64,
        step_id: i64,
        status: RunStatus,
        message: Option<String>,
    ) -> Result<StepRun, AuditError> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;

        if let Some(row) = tables
            .step_runs
            .iter_mut()
            .find(|r| r.run_id == run_id && r.step_id == step_id)
        {
            if row.status.is_terminal() {
                return Ok(row.clone());
            }
            row.end_time = Some(now);
            row.status = status;
            row.duration_sec = Some(duration_between(row.start_time, now));
            row.message = message;
            return Ok(row.clone());
        }

        warn!(run_id = %run_id, step_id = step_id, "Finishing step run that was never started");
        let row = StepRun {
            run_id,
            task_id,
            step_id,
            start_time: now,
            end_time: Some(now),
            status,
            duration_sec: Some(0.0),
            message,
        };
        tables.step_runs.push(row.clone());
        Ok(row)
    }

    #[instrument(skip(self, event), fields(run_id = %event.run_id, file = %event.file_name, status = %event.status))]
    async fn record_file_event(&self, event: NewFileEvent) -> Result<FileEvent, AuditError> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;

        let (duration_sec, bytes_per_sec) = match event.status.start_status() {
            Some(start_status) => tables
                .file_events
                .iter()
                .rev()
                .find(|e| {
                    e.run_id == event.run_id
                        && e.file_id == event.file_id
                        && e.status == start_status
                })
                .map(|start| completion_metrics(start.timestamp, now, event.size))
                .unwrap_or((None, None)),
            None => (None, None),
        };

        let row = FileEvent {
            id: tables.file_events.len() as i64 + 1,
            run_id: event.run_id,
            task_id: event.task_id,
            step_id: event.step_id,
            file_id: event.file_id,
            file_name: event.file_name,
            size: event.size.map(|s| s as i64),
            status: event.status,
            timestamp: now,
            duration_sec,
            bytes_per_sec,
        };
        tables.file_events.push(row.clone());
        Ok(row)
    }

    async fn task_runs(&self, limit: usize) -> Result<Vec<TaskRun>, AuditError> {
        let tables = self.tables.lock().await;
        Ok(tables.task_runs.iter().rev().take(limit).cloned().collect())
    }

    async fn task_run(&self, run_id: Uuid) -> Result<Option<TaskRun>, AuditError> {
        let tables = self.tables.lock().await;
        Ok(tables.task_runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, AuditError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .step_runs
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn file_events(&self, run_id: Uuid) -> Result<Vec<FileEvent>, AuditError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .file_events
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn latest_file_events(&self, limit: usize) -> Result<Vec<FileEvent>, AuditError> {
        let tables = self.tables.lock().await;
        let mut seen = HashSet::new();
        Ok(tables
            .file_events
            .iter()
            .rev()
            .filter(|e| seen.insert((e.run_id, e.step_id, e.file_id)))
            .take(limit)
            .cloned()
            .collect())
    }
}
