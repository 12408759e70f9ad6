// Transfer plugins
// List, download and upload for each protocol kind

use super::args::{ListArgs, TransferArgs};
use super::{Plugin, PluginContext};
use crate::errors::PluginError;
use crate::models::{Direction, HostKind};
use crate::protocol::{self, list_matching, run_transfer, TransferJob, TransferProtocol};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Protocol family a transfer plugin is registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    LocalDirectory,
    Ftp,
    Sftp,
    SmbCifs,
}

impl ProtocolKind {
    /// Whether a host of `kind` can be reached by this plugin family
    pub fn accepts(&self, kind: HostKind) -> bool {
        matches!(
            (self, kind),
            (ProtocolKind::LocalDirectory, HostKind::LocalDirectory)
                | (ProtocolKind::Ftp, HostKind::Ftp)
                | (ProtocolKind::Sftp, HostKind::Sftp)
                | (ProtocolKind::SmbCifs, HostKind::Smb | HostKind::UncShare)
        )
    }
}

fn open(
    kind: ProtocolKind,
    plugin: &str,
    ctx: &PluginContext,
) -> Result<Box<dyn TransferProtocol>, PluginError> {
    let host = ctx.require_host(plugin)?;
    if !kind.accepts(host.kind) {
        return Err(PluginError::Configuration(format!(
            "Plugin '{}' cannot use host '{}' of type {}",
            plugin, host.name, host.kind
        )));
    }
    protocol::for_host(host, ctx.timeouts).map_err(|e| PluginError::Configuration(e.to_string()))
}

/// List and filter remote files without transferring them
pub struct ListFiles {
    name: &'static str,
    kind: ProtocolKind,
    args: ListArgs,
}

impl ListFiles {
    pub fn new(name: &'static str, kind: ProtocolKind, args: ListArgs) -> Self {
        Self { name, kind, args }
    }
}

#[async_trait]
impl Plugin for ListFiles {
    fn name(&self) -> &'static str {
        self.name
    }

    #[instrument(skip_all, fields(plugin = self.name, step_id = ctx.step_id))]
    async fn process(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        let mut backend = open(self.kind, self.name, ctx)?;
        let (found, matched) = list_matching(
            backend.as_mut(),
            &self.args.file_filter,
            self.args.max_file_count,
        )
        .await?;

        info!(found = found.len(), matched = matched.len(), "Listed remote files");
        ctx.set_files("found_files", &found);
        ctx.set_files("matched_files", &matched);
        Ok(())
    }
}

/// Move matching files between a remote endpoint and the staging area
pub struct TransferFiles {
    name: &'static str,
    kind: ProtocolKind,
    direction: Direction,
    args: TransferArgs,
}

impl TransferFiles {
    pub fn new(
        name: &'static str,
        kind: ProtocolKind,
        direction: Direction,
        args: TransferArgs,
    ) -> Self {
        Self {
            name,
            kind,
            direction,
            args,
        }
    }
}

#[async_trait]
impl Plugin for TransferFiles {
    fn name(&self) -> &'static str {
        self.name
    }

    #[instrument(skip_all, fields(plugin = self.name, step_id = ctx.step_id))]
    async fn process(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        let mut backend = open(self.kind, self.name, ctx)?;
        let audit = Arc::clone(&ctx.audit);
        let staging_dir = ctx.staging_dir.clone();

        let job = TransferJob {
            direction: self.direction,
            staging_dir: &staging_dir,
            file_filter: &self.args.file_filter,
            max_file_count: self.args.max_file_count,
            delete_source: self.args.delete_files,
            audit: audit.as_ref(),
            run_id: ctx.run_id,
            task_id: ctx.task_id,
            step_id: ctx.step_id,
        };
        let summary = run_transfer(backend.as_mut(), &job).await?;

        ctx.set_files("found_files", &summary.found);
        ctx.set_files("matched_files", &summary.matched);
        ctx.set_files(self.direction.output_key(), &summary.done);

        if !summary.failed.is_empty() {
            warn!(
                failed = summary.failed.len(),
                done = summary.done.len(),
                "Some files failed to transfer"
            );
            if self.args.fail_on_file_error {
                return Err(PluginError::FileErrors {
                    failed: summary.failed.len(),
                    files: summary.failed,
                });
            }
        }
        Ok(())
    }
}
