// Plugin argument shapes
// Decoded from the step's rendered argument JSON; unknown keys are rejected

use crate::errors::PluginError;
use serde::de::DeserializeOwned;
use serde::Deserialize;

fn default_filter() -> String {
    "*.*".to_string()
}

/// Decode a rendered argument document
///
/// A blank document is treated as `{}` so that every default applies.
pub fn parse<T: DeserializeOwned>(raw: &str) -> Result<T, PluginError> {
    let raw = raw.trim();
    let raw = if raw.is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).map_err(|e| PluginError::InvalidArguments(e.to_string()))
}

fn check_filter(filter: &str) -> Result<(), PluginError> {
    if filter.trim().is_empty() {
        return Err(PluginError::InvalidArguments(
            "file_filter must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Arguments of the download/upload plugins
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferArgs {
    #[serde(default = "default_filter")]
    pub file_filter: String,
    #[serde(default)]
    pub delete_files: bool,
    #[serde(default)]
    pub max_file_count: Option<usize>,
    /// Fail the step when any single file fails
    #[serde(default)]
    pub fail_on_file_error: bool,
}

impl TransferArgs {
    pub fn validate(self) -> Result<Self, PluginError> {
        check_filter(&self.file_filter)?;
        Ok(self)
    }
}

/// Arguments of the list-only plugins
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListArgs {
    #[serde(default = "default_filter")]
    pub file_filter: String,
    #[serde(default)]
    pub max_file_count: Option<usize>,
}

impl ListArgs {
    pub fn validate(self) -> Result<Self, PluginError> {
        check_filter(&self.file_filter)?;
        Ok(self)
    }
}

/// Arguments of `workspace_rename_files`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameArgs {
    #[serde(default = "default_filter")]
    pub file_filter: String,
    /// Target name pattern with `[orig_name]`, `[stem]`, `[ext]` and `[timestamp]` tokens
    pub filename: String,
}

impl RenameArgs {
    pub fn validate(self) -> Result<Self, PluginError> {
        check_filter(&self.file_filter)?;
        if self.filename.trim().is_empty() {
            return Err(PluginError::InvalidArguments(
                "filename must not be empty".to_string(),
            ));
        }
        if self.filename.contains('/') || self.filename.contains('\\') {
            return Err(PluginError::InvalidArguments(format!(
                "filename '{}' must not contain path separators",
                self.filename
            )));
        }
        Ok(self)
    }
}

/// Arguments of `mail_send_files`
///
/// Addressing fields are optional in the document so that a missing one is
/// reported as a configuration problem rather than a decode error.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailArgs {
    #[serde(default = "default_filter")]
    pub file_filter: String,
    #[serde(default)]
    pub delete_files: bool,
    #[serde(default)]
    pub from_address: Option<String>,
    #[serde(default)]
    pub to_addresses: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl MailArgs {
    pub fn validate(self) -> Result<Self, PluginError> {
        check_filter(&self.file_filter)?;
        Ok(self)
    }
}

/// Arguments of plugins that take none
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoArgs {}
