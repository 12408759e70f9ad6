// Workspace plugins
// Create, delete and rename-in-place on the run's staging directory

use super::args::RenameArgs;
use super::{Plugin, PluginContext};
use crate::errors::{PluginError, TransferError};
use crate::filter;
use crate::protocol::local::list_directory;
use crate::staging::{io_error, remove_directory};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use tracing::{info, instrument};

/// Ensure the staging directory exists
pub struct CreateWorkspace;

#[async_trait]
impl Plugin for CreateWorkspace {
    fn name(&self) -> &'static str {
        "workspace_create"
    }

    async fn process(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        // The engine normally created it already
        tokio::fs::create_dir_all(&ctx.staging_dir)
            .await
            .map_err(|e| io_error(&ctx.staging_dir, e))?;
        info!(path = %ctx.staging_dir.display(), "Workspace ready");
        Ok(())
    }
}

/// Remove the staging directory and everything in it
pub struct DeleteWorkspace;

#[async_trait]
impl Plugin for DeleteWorkspace {
    fn name(&self) -> &'static str {
        "workspace_delete"
    }

    async fn process(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        remove_directory(&ctx.staging_dir).await?;
        Ok(())
    }
}

/// Rename staged files that match a filter
pub struct RenameFiles {
    args: RenameArgs,
}

impl RenameFiles {
    pub fn new(args: RenameArgs) -> Self {
        Self { args }
    }
}

/// Expand `[orig_name]`, `[stem]`, `[ext]` and `[timestamp]` for one file
pub fn target_name(pattern: &str, original: &str, timestamp: &str) -> String {
    let (stem, ext) = match original.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (original, ""),
    };
    pattern
        .replace("[orig_name]", original)
        .replace("[stem]", stem)
        .replace("[ext]", ext)
        .replace("[timestamp]", timestamp)
}

#[async_trait]
impl Plugin for RenameFiles {
    fn name(&self) -> &'static str {
        "workspace_rename_files"
    }

    #[instrument(skip_all, fields(step_id = ctx.step_id, filename = %self.args.filename))]
    async fn process(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        let found = list_directory(&ctx.staging_dir).await?;
        let matched = filter::filter_records(&found, &self.args.file_filter);
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();

        // Resolve every target before touching the filesystem
        let existing: HashSet<&str> = found.iter().map(|f| f.name.as_str()).collect();
        let matched_names: HashSet<&str> = matched.iter().map(|f| f.name.as_str()).collect();
        let mut targets = HashSet::new();
        let mut plan = Vec::with_capacity(matched.len());
        for file in &matched {
            let target = target_name(&self.args.filename, &file.name, &timestamp);
            if target.is_empty() || target.contains('/') {
                return Err(PluginError::InvalidArguments(format!(
                    "'{}' expands to invalid name '{}'",
                    file.name, target
                )));
            }
            if !targets.insert(target.clone()) {
                return Err(PluginError::InvalidArguments(format!(
                    "More than one file would be renamed to '{}'",
                    target
                )));
            }
            // Renaming onto a file that is not itself being renamed would replace it
            if target != file.name
                && existing.contains(target.as_str())
                && !matched_names.contains(target.as_str())
            {
                return Err(PluginError::Transfer(TransferError::remote(
                    "rename",
                    &file.name,
                    format!("{} already exists", target),
                )));
            }
            plan.push((file.name.clone(), target));
        }

        // Two passes through temporary names so swaps within the set are safe
        for (index, (from, _)) in plan.iter().enumerate() {
            let from_path = ctx.staging_dir.join(from);
            let temp_path = ctx.staging_dir.join(format!(".rename-{}-{}", index, ctx.run_id));
            tokio::fs::rename(&from_path, &temp_path)
                .await
                .map_err(|e| io_error(&from_path, e))?;
        }
        let mut renamed = Vec::with_capacity(plan.len());
        for (index, (from, to)) in plan.into_iter().enumerate() {
            let temp_path = ctx.staging_dir.join(format!(".rename-{}-{}", index, ctx.run_id));
            let to_path = ctx.staging_dir.join(&to);
            tokio::fs::rename(&temp_path, &to_path)
                .await
                .map_err(|e| io_error(&temp_path, e))?;
            info!(from = %from, to = %to, "Renamed staged file");
            renamed.push(serde_json::Value::String(to));
        }

        ctx.set_files("found_files", &found);
        ctx.set_files("matched_files", &matched);
        ctx.variables
            .insert("renamed_files".to_string(), serde_json::Value::Array(renamed));
        Ok(())
    }
}
