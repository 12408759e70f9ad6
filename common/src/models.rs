use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Catalog Models
// ============================================================================

/// Task is a named, schedulable unit of work composed of ordered steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}

impl Task {
    /// Sort steps by `sort_order`, breaking ties by id so ordering is stable across loads
    pub fn sort_steps(&mut self) {
        self.steps.sort_by_key(|s| (s.sort_order, s.id));
    }
}

/// Step is one action within a task, bound to a plugin and optionally a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    #[serde(default)]
    pub task_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub sort_order: i32,
    /// Plugin name resolved through the registry at run time
    pub script: String,
    /// Raw JSON argument template, rendered against the run variables before decoding
    #[serde(default = "default_arguments", deserialize_with = "arguments_template")]
    pub arguments: String,
    #[serde(default)]
    pub host_id: Option<i64>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Step {
    /// Human-readable label used in logs
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", name, self.script),
            None => self.script.clone(),
        }
    }
}

/// Host is a named local or remote endpoint with connection credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: HostKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub share: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("directory", &self.directory)
            .field("share", &self.share)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Host {
    /// Address string for logs, e.g. `sftp.example.com:22`
    pub fn address(&self) -> String {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.clone(),
            (None, _) => self.directory.clone().unwrap_or_else(|| self.name.clone()),
        }
    }
}

/// HostKind defines which transfer protocol a host speaks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    LocalDirectory,
    UncShare,
    Ftp,
    Sftp,
    Smb,
}

impl std::fmt::Display for HostKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostKind::LocalDirectory => write!(f, "local_directory"),
            HostKind::UncShare => write!(f, "unc_share"),
            HostKind::Ftp => write!(f, "ftp"),
            HostKind::Sftp => write!(f, "sftp"),
            HostKind::Smb => write!(f, "smb"),
        }
    }
}

/// Schedule binds a cron expression to a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    #[serde(default)]
    pub task_id: i64,
    pub cron: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

fn default_arguments() -> String {
    "{}".to_string()
}

/// Arguments may be given as a template string or as a plain JSON object
fn arguments_template<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(template) => Ok(template),
        serde_json::Value::Null => Ok(default_arguments()),
        other => Ok(other.to_string()),
    }
}

// ============================================================================
// In-flight File Record
// ============================================================================

/// FileRecord is a file observed during one run
///
/// `file_id` is generated once, on first observation, and correlates every
/// audit row written for the same physical file within the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub name: String,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    pub file_id: Uuid,
}

impl FileRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: None,
            modified: None,
            file_id: Uuid::new_v4(),
        }
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    pub fn with_modified(mut self, modified: Option<DateTime<Utc>>) -> Self {
        self.modified = modified;
        self
    }
}

/// Transfer direction relative to the staging area
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Remote endpoint → staging area
    Download,
    /// Staging area → remote endpoint
    Upload,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }

    /// Status written when a file transfer begins
    pub fn in_flight_status(&self) -> FileStatus {
        match self {
            Direction::Download => FileStatus::Downloading,
            Direction::Upload => FileStatus::Uploading,
        }
    }

    /// Status written when a file transfer completes
    pub fn done_status(&self) -> FileStatus {
        match self {
            Direction::Download => FileStatus::Downloaded,
            Direction::Upload => FileStatus::Uploaded,
        }
    }

    /// Variable name the transfer plugins publish the done set under
    pub fn output_key(&self) -> &'static str {
        match self {
            Direction::Download => "downloaded_files",
            Direction::Upload => "uploaded_files",
        }
    }
}

// ============================================================================
// Audit Models
// ============================================================================

/// RunStatus is the status of a task or step run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

impl TryFrom<String> for RunStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        Self::from_str(&s)
    }
}

/// FileStatus is one lifecycle transition of a file within a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Downloading,
    Downloaded,
    Uploading,
    Uploaded,
    Mailed,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Downloading => "downloading",
            FileStatus::Downloaded => "downloaded",
            FileStatus::Uploading => "uploading",
            FileStatus::Uploaded => "uploaded",
            FileStatus::Mailed => "mailed",
            FileStatus::Error => "error",
        }
    }

    /// For completion states, the in-flight status that started the transfer
    pub fn start_status(&self) -> Option<FileStatus> {
        match self {
            FileStatus::Downloaded => Some(FileStatus::Downloading),
            FileStatus::Uploaded => Some(FileStatus::Uploading),
            _ => None,
        }
    }

    /// Whether the file reached its destination
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            FileStatus::Downloaded | FileStatus::Uploaded | FileStatus::Mailed
        )
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "downloading" => Ok(FileStatus::Downloading),
            "downloaded" => Ok(FileStatus::Downloaded),
            "uploading" => Ok(FileStatus::Uploading),
            "uploaded" => Ok(FileStatus::Uploaded),
            "mailed" => Ok(FileStatus::Mailed),
            "error" => Ok(FileStatus::Error),
            _ => Err(format!("Invalid file status: {}", s)),
        }
    }
}

impl TryFrom<String> for FileStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        Self::from_str(&s)
    }
}

/// TaskRun is the audit row for one task execution
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRun {
    pub run_id: Uuid,
    pub task_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: RunStatus,
    pub duration_sec: Option<f64>,
    pub message: Option<String>,
}

/// StepRun is the audit row for one step within a task run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepRun {
    pub run_id: Uuid,
    pub task_id: i64,
    pub step_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: RunStatus,
    pub duration_sec: Option<f64>,
    pub message: Option<String>,
}

/// FileEvent is an append-only audit row for one file lifecycle transition
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FileEvent {
    pub id: i64,
    pub run_id: Uuid,
    pub task_id: i64,
    pub step_id: i64,
    pub file_id: Uuid,
    pub file_name: String,
    pub size: Option<i64>,
    #[sqlx(try_from = "String")]
    pub status: FileStatus,
    pub timestamp: DateTime<Utc>,
    pub duration_sec: Option<f64>,
    pub bytes_per_sec: Option<f64>,
}

/// Duration between two timestamps in fractional seconds
pub fn duration_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
}
