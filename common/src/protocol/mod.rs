// Transfer protocols
// Uniform list/rename/get/put/delete contract over local directories, FTP, SFTP and SMB

pub mod ftp;
pub mod local;
pub mod sftp;
#[cfg(feature = "smb")]
pub mod smb;
pub mod transfer;

pub use ftp::FtpProtocol;
pub use local::LocalDirectory;
pub use sftp::SftpProtocol;
#[cfg(feature = "smb")]
pub use smb::SmbProtocol;
pub use transfer::{list_matching, run_transfer, TransferJob, TransferSummary, CLAIM_SUFFIX};

use crate::config::TransferConfig;
use crate::errors::TransferError;
use crate::models::{FileRecord, Host, HostKind};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Primitive I/O a transfer backend supplies
///
/// Names are relative to the host's configured directory. Claim, release and
/// audit logic live in [`run_transfer`], not in the backends.
#[async_trait]
pub trait TransferProtocol: Send {
    /// Short description for logs, e.g. `sftp://partner@sftp.example.com:22/out`
    fn describe(&self) -> String;

    /// Establish the session
    ///
    /// Returns `Ok(false)` for expected connectivity problems (unreachable
    /// host, bad credentials, missing host fields) and `Err` only for
    /// unexpected failures.
    async fn connect(&mut self) -> Result<bool, TransferError>;

    /// Files (not directories) in the remote directory
    async fn list_remote(&mut self) -> Result<Vec<FileRecord>, TransferError>;

    /// Rename a remote file; an existing target is never replaced
    async fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), TransferError>;

    /// Copy a remote file to `local_path`, returning bytes written
    async fn download(&mut self, remote_name: &str, local_path: &Path)
        -> Result<u64, TransferError>;

    /// Copy `local_path` to a remote file, returning bytes written
    async fn upload(&mut self, local_path: &Path, remote_name: &str)
        -> Result<u64, TransferError>;

    async fn delete_remote(&mut self, name: &str) -> Result<(), TransferError>;

    /// Release the session; safe to call when not connected
    async fn disconnect(&mut self) -> Result<(), TransferError>;
}

/// Connection timeouts applied by network backends
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub io: Duration,
}

impl From<&TransferConfig> for Timeouts {
    fn from(config: &TransferConfig) -> Self {
        Self {
            connect: Duration::from_secs(config.connect_timeout_seconds),
            io: Duration::from_secs(config.io_timeout_seconds),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

/// Build the backend matching a host's kind
///
/// `unc_share` hosts are reached through SMB. Without the `smb` feature,
/// SMB hosts are rejected as unsupported.
pub fn for_host(
    host: &Host,
    timeouts: Timeouts,
) -> Result<Box<dyn TransferProtocol>, TransferError> {
    match host.kind {
        HostKind::LocalDirectory => Ok(Box::new(LocalDirectory::new(host))),
        HostKind::Ftp => Ok(Box::new(FtpProtocol::new(host, timeouts))),
        HostKind::Sftp => Ok(Box::new(SftpProtocol::new(host, timeouts))),
        HostKind::Smb | HostKind::UncShare => smb_for_host(host, timeouts),
    }
}

#[cfg(feature = "smb")]
fn smb_for_host(
    host: &Host,
    _timeouts: Timeouts,
) -> Result<Box<dyn TransferProtocol>, TransferError> {
    Ok(Box::new(SmbProtocol::new(host)))
}

#[cfg(not(feature = "smb"))]
fn smb_for_host(
    host: &Host,
    _timeouts: Timeouts,
) -> Result<Box<dyn TransferProtocol>, TransferError> {
    Err(TransferError::Unsupported(format!(
        "host '{}' is {}, but SMB support was not compiled in (enable the `smb` feature)",
        host.name, host.kind
    )))
}

/// Non-empty value of an optional host field
pub(crate) fn required(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Join a remote directory and a file name with `/`
pub(crate) fn remote_join(directory: Option<&str>, name: &str) -> String {
    match directory.map(|d| d.trim_end_matches('/')) {
        Some(dir) if !dir.is_empty() => format!("{}/{}", dir, name),
        Some(_) => format!("/{}", name),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(kind: HostKind) -> Host {
        Host {
            id: 1,
            name: "h".to_string(),
            kind,
            host: None,
            port: None,
            directory: Some("/tmp".to_string()),
            share: None,
            username: None,
            password: None,
            description: None,
        }
    }

    #[test]
    fn test_for_host_builds_matching_backend() {
        let local = for_host(&host(HostKind::LocalDirectory), Timeouts::default()).unwrap();
        assert!(local.describe().starts_with("file://"));
        let sftp = for_host(&host(HostKind::Sftp), Timeouts::default()).unwrap();
        assert!(sftp.describe().starts_with("sftp://"));
        let ftp = for_host(&host(HostKind::Ftp), Timeouts::default()).unwrap();
        assert!(ftp.describe().starts_with("ftp://"));
    }

    #[cfg(not(feature = "smb"))]
    #[test]
    fn test_smb_without_feature_is_unsupported() {
        let result = for_host(&host(HostKind::UncShare), Timeouts::default());
        assert!(matches!(result, Err(TransferError::Unsupported(_))));
    }

    #[test]
    fn test_required_ignores_blank_values() {
        assert_eq!(required(&Some(" x ".to_string())), Some("x"));
        assert_eq!(required(&Some("  ".to_string())), None);
        assert_eq!(required(&None), None);
    }

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join(Some("/out/"), "a.txt"), "/out/a.txt");
        assert_eq!(remote_join(Some("out"), "a.txt"), "out/a.txt");
        assert_eq!(remote_join(Some("/"), "a.txt"), "/a.txt");
        assert_eq!(remote_join(None, "a.txt"), "a.txt");
    }
}
