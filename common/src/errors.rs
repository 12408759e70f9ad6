// Error handling framework
// One enum per concern; binaries wrap these in anyhow at the boundary.

use thiserror::Error;

/// Errors raised by transfer protocol primitives
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Connection to {host} failed: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote operation '{operation}' failed for {path}: {reason}")]
    Remote {
        operation: String,
        path: String,
        reason: String,
    },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl TransferError {
    /// Build a `Remote` error from any displayable protocol error
    pub fn remote(operation: &str, path: &str, reason: impl std::fmt::Display) -> Self {
        TransferError::Remote {
            operation: operation.to_string(),
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Staging area errors
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Staging directory already exists: {0}")]
    AlreadyExists(String),

    #[error("Staging I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Template substitution errors
#[derive(Error, Debug)]
pub enum SubstitutionError {
    #[error("Undefined variable(s) in template: {variables:?}")]
    UndefinedVariable { variables: Vec<String> },

    #[error("Malformed template at byte {position}: {reason}")]
    Malformed { position: usize, reason: String },

    #[error("Failed to encode variable '{name}': {reason}")]
    Encoding { name: String, reason: String },
}

/// Step plugin errors
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Invalid plugin arguments: {0}")]
    InvalidArguments(String),

    #[error("Argument template error: {0}")]
    Template(#[from] SubstitutionError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("Mail delivery failed: {0}")]
    Mail(String),

    #[error("{failed} file(s) failed to transfer: {files:?}")]
    FileErrors { failed: usize, files: Vec<String> },

    #[error("Audit log error: {0}")]
    Audit(#[from] AuditError),

    #[error("Plugin '{plugin}' panicked: {message}")]
    Panicked { plugin: String, message: String },
}

/// Audit log store errors
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Audit record not found: {0}")]
    NotFound(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Task/host catalog errors
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse catalog: {0}")]
    Parse(String),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Host not found: {0}")]
    HostNotFound(i64),
}

/// Schedule-related errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("No next execution time available for '{0}'")]
    NoNextExecution(String),
}

/// Run-level errors surfaced by the task execution engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No plugin registered for script '{0}'")]
    PluginNotFound(String),

    #[error("Step {step_id} failed: {message}")]
    StepFailed { step_id: i64, message: String },

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("Audit log error: {0}")]
    Audit(#[from] AuditError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Run worker panicked: {0}")]
    Panicked(String),
}

impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AuditError::NotFound("Record not found".to_string()),
            _ => AuditError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        PluginError::InvalidArguments(err.to_string())
    }
}
