// SFTP backend
// Session-multiplexed binary get/put with remote rename/unlink over ssh2

mod connection;

pub use connection::SftpConnection;

use super::{remote_join, required, Timeouts, TransferProtocol};
use crate::errors::TransferError;
use crate::models::{FileRecord, Host};
use async_trait::async_trait;
use chrono::DateTime;
use ssh2::{RenameFlags, Sftp};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

const DEFAULT_PORT: u16 = 22;

pub struct SftpProtocol {
    name: String,
    hostname: Option<String>,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    directory: Option<String>,
    timeouts: Timeouts,
    connection: Option<SftpConnection>,
}

impl SftpProtocol {
    pub fn new(host: &Host, timeouts: Timeouts) -> Self {
        Self {
            name: host.name.clone(),
            hostname: host.host.clone(),
            port: host.port.unwrap_or(DEFAULT_PORT),
            username: host.username.clone(),
            password: host.password.clone(),
            directory: host.directory.clone(),
            timeouts,
            connection: None,
        }
    }

    fn sftp(&self) -> Result<&Sftp, TransferError> {
        self.connection
            .as_ref()
            .map(SftpConnection::sftp)
            .ok_or_else(|| TransferError::NotConnected(self.describe()))
    }

    fn path(&self, name: &str) -> PathBuf {
        PathBuf::from(remote_join(self.directory.as_deref(), name))
    }
}

#[async_trait]
impl TransferProtocol for SftpProtocol {
    fn describe(&self) -> String {
        format!(
            "sftp://{}@{}:{}/{}",
            self.username.as_deref().unwrap_or(""),
            self.hostname.as_deref().unwrap_or(""),
            self.port,
            self.directory.as_deref().unwrap_or("").trim_start_matches('/')
        )
    }

    #[instrument(skip(self), fields(host = %self.name))]
    async fn connect(&mut self) -> Result<bool, TransferError> {
        let (Some(hostname), Some(username), Some(password)) = (
            required(&self.hostname),
            required(&self.username),
            required(&self.password),
        ) else {
            warn!(host = %self.name, "SFTP host requires hostname, username and password");
            return Ok(false);
        };

        match SftpConnection::connect(hostname, self.port, username, password, self.timeouts) {
            Ok(connection) => {
                self.connection = Some(connection);
                Ok(true)
            }
            Err(TransferError::ConnectionFailed { host, reason }) => {
                warn!(host = %host, reason = %reason, "SFTP connection failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn list_remote(&mut self) -> Result<Vec<FileRecord>, TransferError> {
        let directory = PathBuf::from(self.directory.as_deref().unwrap_or("."));
        let entries = self
            .sftp()?
            .readdir(&directory)
            .map_err(|e| TransferError::remote("list", &directory.display().to_string(), e))?;

        let mut records = Vec::with_capacity(entries.len());
        for (path, stat) in entries {
            if !stat.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let modified = stat
                .mtime
                .and_then(|secs| DateTime::from_timestamp(secs as i64, 0));
            records.push(
                FileRecord::new(name)
                    .with_size(stat.size)
                    .with_modified(modified),
            );
        }
        debug!(count = records.len(), "Listed SFTP directory");
        Ok(records)
    }

    async fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), TransferError> {
        let (from_path, to_path) = (self.path(from), self.path(to));
        self.sftp()?
            .rename(&from_path, &to_path, Some(RenameFlags::ATOMIC | RenameFlags::NATIVE))
            .map_err(|e| TransferError::remote("rename", from, e))
    }

    async fn download(
        &mut self,
        remote_name: &str,
        local_path: &Path,
    ) -> Result<u64, TransferError> {
        let mut remote = self
            .sftp()?
            .open(&self.path(remote_name))
            .map_err(|e| TransferError::remote("open", remote_name, e))?;
        let mut local = std::fs::File::create(local_path)?;
        std::io::copy(&mut remote, &mut local)
            .map_err(|e| TransferError::remote("download", remote_name, e))
    }

    async fn upload(&mut self, local_path: &Path, remote_name: &str) -> Result<u64, TransferError> {
        let mut local = std::fs::File::open(local_path)?;
        let mut remote = self
            .sftp()?
            .create(&self.path(remote_name))
            .map_err(|e| TransferError::remote("create", remote_name, e))?;
        std::io::copy(&mut local, &mut remote)
            .map_err(|e| TransferError::remote("upload", remote_name, e))
    }

    async fn delete_remote(&mut self, name: &str) -> Result<(), TransferError> {
        self.sftp()?
            .unlink(&self.path(name))
            .map_err(|e| TransferError::remote("delete", name, e))
    }

    async fn disconnect(&mut self) -> Result<(), TransferError> {
        if let Some(connection) = self.connection.take() {
            connection.close();
            debug!(host = %self.name, "SFTP session closed");
        }
        Ok(())
    }
}
