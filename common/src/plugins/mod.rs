// Step plugins
// Each step's `script` names one plugin; plugins perform one side-effecting operation
// and publish outputs into the run's variable bag

pub mod args;
pub mod mail;
pub mod registry;
pub mod transfer;
pub mod workspace;

pub use mail::{MailAttachment, MailMessage, Mailer, SmtpMailer};
pub use registry::{PluginFactory, PluginRegistry};

use crate::audit::AuditLog;
use crate::errors::PluginError;
use crate::models::{FileRecord, Host};
use crate::protocol::Timeouts;
use crate::substitution::Variables;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a plugin sees while processing one step
pub struct PluginContext {
    pub run_id: Uuid,
    pub task_id: i64,
    pub step_id: i64,
    /// Host bound to the step, if any
    pub host: Option<Host>,
    pub staging_dir: PathBuf,
    /// Shared across all steps of the run; plugins add their outputs here
    pub variables: Variables,
    pub audit: Arc<dyn AuditLog>,
    pub mailer: Arc<dyn Mailer>,
    pub timeouts: Timeouts,
}

impl PluginContext {
    /// The step's host, or a configuration error naming the plugin
    pub fn require_host(&self, plugin: &str) -> Result<&Host, PluginError> {
        self.host.as_ref().ok_or_else(|| {
            PluginError::Configuration(format!(
                "Plugin '{}' requires a host but step {} has none",
                plugin, self.step_id
            ))
        })
    }

    /// Publish a list of file names under `key`
    pub fn set_files(&mut self, key: &str, files: &[FileRecord]) {
        let names: Vec<Value> = files
            .iter()
            .map(|f| Value::String(f.name.clone()))
            .collect();
        self.variables.insert(key.to_string(), Value::Array(names));
    }
}

/// A step operation built from validated arguments
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Registered script name
    fn name(&self) -> &'static str;

    /// Execute the operation once
    async fn process(&self, ctx: &mut PluginContext) -> Result<(), PluginError>;
}
