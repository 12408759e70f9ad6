// Local directory backend

use super::{required, TransferProtocol};
use crate::errors::TransferError;
use crate::models::{FileRecord, Host};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Transfers to and from a directory on the local filesystem
pub struct LocalDirectory {
    name: String,
    directory: Option<String>,
    root: Option<PathBuf>,
}

impl LocalDirectory {
    pub fn new(host: &Host) -> Self {
        Self {
            name: host.name.clone(),
            directory: host.directory.clone(),
            root: None,
        }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, TransferError> {
        self.root
            .as_ref()
            .map(|root| root.join(name))
            .ok_or_else(|| TransferError::NotConnected(self.describe()))
    }
}

#[async_trait]
impl TransferProtocol for LocalDirectory {
    fn describe(&self) -> String {
        format!("file://{}", self.directory.as_deref().unwrap_or(""))
    }

    #[instrument(skip(self), fields(host = %self.name))]
    async fn connect(&mut self) -> Result<bool, TransferError> {
        let Some(directory) = required(&self.directory) else {
            warn!(host = %self.name, "Local directory host has no directory configured");
            return Ok(false);
        };

        let root = PathBuf::from(directory);
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {
                debug!(directory = %root.display(), "Local directory resolved");
                self.root = Some(root);
                Ok(true)
            }
            Ok(_) => {
                warn!(directory = %root.display(), "Configured path is not a directory");
                Ok(false)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(directory = %root.display(), "Local directory does not exist");
                Ok(false)
            }
            Err(e) => Err(TransferError::Io(e)),
        }
    }

    async fn list_remote(&mut self) -> Result<Vec<FileRecord>, TransferError> {
        let root = self.resolve("")?;
        list_directory(&root).await
    }

    async fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), TransferError> {
        let (from_path, to_path) = (self.resolve(from)?, self.resolve(to)?);
        // fs::rename silently replaces on unix
        if tokio::fs::try_exists(&to_path).await? {
            return Err(TransferError::remote("rename", from, format!("{} already exists", to)));
        }
        tokio::fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| TransferError::remote("rename", from, e))
    }

    async fn download(
        &mut self,
        remote_name: &str,
        local_path: &Path,
    ) -> Result<u64, TransferError> {
        let source = self.resolve(remote_name)?;
        tokio::fs::copy(&source, local_path)
            .await
            .map_err(|e| TransferError::remote("download", remote_name, e))
    }

    async fn upload(&mut self, local_path: &Path, remote_name: &str) -> Result<u64, TransferError> {
        let target = self.resolve(remote_name)?;
        tokio::fs::copy(local_path, &target)
            .await
            .map_err(|e| TransferError::remote("upload", remote_name, e))
    }

    async fn delete_remote(&mut self, name: &str) -> Result<(), TransferError> {
        let path = self.resolve(name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| TransferError::remote("delete", name, e))
    }

    async fn disconnect(&mut self) -> Result<(), TransferError> {
        self.root = None;
        Ok(())
    }
}

/// Regular files directly inside `path`, sorted by name
pub async fn list_directory(path: &Path) -> Result<Vec<FileRecord>, TransferError> {
    let mut entries = tokio::fs::read_dir(path).await?;
    let mut records = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!(path = ?entry.path(), "Skipping file with non UTF-8 name");
            continue;
        };
        let modified = meta.modified().ok().map(DateTime::<Utc>::from);
        records.push(
            FileRecord::new(name)
                .with_size(Some(meta.len()))
                .with_modified(modified),
        );
    }

    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}
