// SMB/CIFS backend
// Share-relative paths over libsmbclient (pavao); enabled with the `smb` feature

use super::{remote_join, required, TransferProtocol};
use crate::errors::TransferError;
use crate::models::{FileRecord, Host};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pavao::{SmbClient, SmbCredentials, SmbDirentType, SmbOpenOptions, SmbOptions};
use std::path::Path;
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_PORT: u16 = 445;

#[derive(Clone)]
struct Target {
    server: String,
    share: String,
    username: String,
    password: String,
}

/// SMB share backend
///
/// libsmbclient contexts are not `Send`, so a client is opened per operation
/// and never held across an await point.
pub struct SmbProtocol {
    name: String,
    hostname: Option<String>,
    port: u16,
    share: Option<String>,
    username: Option<String>,
    password: Option<String>,
    directory: Option<String>,
    target: Option<Target>,
}

impl SmbProtocol {
    pub fn new(host: &Host) -> Self {
        Self {
            name: host.name.clone(),
            hostname: host.host.clone(),
            port: host.port.unwrap_or(DEFAULT_PORT),
            share: host.share.clone(),
            username: host.username.clone(),
            password: host.password.clone(),
            directory: host.directory.clone(),
            target: None,
        }
    }

    fn client(&self) -> Result<SmbClient, TransferError> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| TransferError::NotConnected(self.describe()))?;
        open_client(target).map_err(|reason| TransferError::ConnectionFailed {
            host: target.server.clone(),
            reason,
        })
    }

    fn path(&self, name: &str) -> String {
        let directory = self.directory.as_deref().unwrap_or("");
        remote_join(Some(&format!("/{}", directory.trim_matches('/'))), name)
    }
}

fn open_client(target: &Target) -> Result<SmbClient, String> {
    SmbClient::new(
        SmbCredentials::default()
            .server(&target.server)
            .share(&target.share)
            .username(&target.username)
            .password(&target.password),
        SmbOptions::default().one_share_per_server(true),
    )
    .map_err(|e| e.to_string())
}

#[async_trait]
impl TransferProtocol for SmbProtocol {
    fn describe(&self) -> String {
        format!(
            "smb://{}@{}:{}/{}/{}",
            self.username.as_deref().unwrap_or(""),
            self.hostname.as_deref().unwrap_or(""),
            self.port,
            self.share.as_deref().unwrap_or("").trim_matches('/'),
            self.directory.as_deref().unwrap_or("").trim_matches('/')
        )
    }

    #[instrument(skip(self), fields(host = %self.name))]
    async fn connect(&mut self) -> Result<bool, TransferError> {
        let (Some(hostname), Some(share), Some(username), Some(password)) = (
            required(&self.hostname),
            required(&self.share),
            required(&self.username),
            required(&self.password),
        ) else {
            warn!(host = %self.name, "SMB host requires hostname, share, username and password");
            return Ok(false);
        };

        let target = Target {
            server: format!("smb://{}:{}", hostname, self.port),
            share: format!("/{}", share.trim_matches('/')),
            username: username.to_string(),
            password: password.to_string(),
        };

        info!(server = %target.server, share = %target.share, "Establishing SMB connection");
        // Probe the share so unreachable hosts fail here rather than mid-transfer
        let probe = open_client(&target).and_then(|client| {
            client
                .list_dir(&self.path(""))
                .map(|_| ())
                .map_err(|e| e.to_string())
        });

        match probe {
            Ok(()) => {
                self.target = Some(target);
                Ok(true)
            }
            Err(reason) => {
                error!(server = %target.server, reason = %reason, "SMB connection failed");
                Ok(false)
            }
        }
    }

    async fn list_remote(&mut self) -> Result<Vec<FileRecord>, TransferError> {
        let client = self.client()?;
        let directory = self.path("");
        let entries = client
            .list_dir(&directory)
            .map_err(|e| TransferError::remote("list", &directory, e))?;

        let mut records = Vec::new();
        for entry in entries {
            if entry.get_type() != SmbDirentType::File {
                continue;
            }
            let name = entry.name().to_string();
            let stat = client.stat(&self.path(&name)).ok();
            records.push(
                FileRecord::new(name)
                    .with_size(stat.as_ref().map(|s| s.size as u64))
                    .with_modified(stat.map(|s| DateTime::<Utc>::from(s.modified))),
            );
        }
        debug!(count = records.len(), "Listed SMB directory");
        Ok(records)
    }

    async fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), TransferError> {
        let client = self.client()?;
        let target = self.path(to);
        if client.stat(&target).is_ok() {
            return Err(TransferError::remote("rename", from, format!("{} already exists", to)));
        }
        client
            .rename(&self.path(from), &target)
            .map_err(|e| TransferError::remote("rename", from, e))
    }

    async fn download(
        &mut self,
        remote_name: &str,
        local_path: &Path,
    ) -> Result<u64, TransferError> {
        let client = self.client()?;
        let mut remote = client
            .open_with(&self.path(remote_name), SmbOpenOptions::default().read(true))
            .map_err(|e| TransferError::remote("open", remote_name, e))?;
        let mut local = std::fs::File::create(local_path)?;
        std::io::copy(&mut remote, &mut local)
            .map_err(|e| TransferError::remote("download", remote_name, e))
    }

    async fn upload(&mut self, local_path: &Path, remote_name: &str) -> Result<u64, TransferError> {
        let client = self.client()?;
        let mut local = std::fs::File::open(local_path)?;
        let mut remote = client
            .open_with(
                &self.path(remote_name),
                SmbOpenOptions::default()
                    .create(true)
                    .write(true)
                    .truncate(true),
            )
            .map_err(|e| TransferError::remote("create", remote_name, e))?;
        std::io::copy(&mut local, &mut remote)
            .map_err(|e| TransferError::remote("upload", remote_name, e))
    }

    async fn delete_remote(&mut self, name: &str) -> Result<(), TransferError> {
        self.client()?
            .unlink(&self.path(name))
            .map_err(|e| TransferError::remote("delete", name, e))
    }

    async fn disconnect(&mut self) -> Result<(), TransferError> {
        self.target = None;
        Ok(())
    }
}
