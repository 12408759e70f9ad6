// Shared transfer orchestration
// Claim, copy, release and audit sequence run on top of any TransferProtocol

use super::local::list_directory;
use super::TransferProtocol;
use crate::audit::{AuditLog, NewFileEvent};
use crate::errors::{PluginError, TransferError};
use crate::filter;
use crate::models::{Direction, FileRecord, FileStatus};
use crate::telemetry;
use std::path::Path;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Suffix marking a file as claimed by a run
pub const CLAIM_SUFFIX: &str = ".processing";

/// One step's transfer request
pub struct TransferJob<'a> {
    pub direction: Direction,
    pub staging_dir: &'a Path,
    pub file_filter: &'a str,
    pub max_file_count: Option<usize>,
    /// Delete the claimed source copy instead of restoring it
    pub delete_source: bool,
    pub audit: &'a dyn AuditLog,
    pub run_id: Uuid,
    pub task_id: i64,
    pub step_id: i64,
}

/// Outcome of a transfer step
#[derive(Debug, Clone, Default)]
pub struct TransferSummary {
    pub found: Vec<FileRecord>,
    pub matched: Vec<FileRecord>,
    pub done: Vec<FileRecord>,
    /// Names of files that failed and were skipped
    pub failed: Vec<String>,
}

fn claimed(name: &str) -> String {
    format!("{}{}", name, CLAIM_SUFFIX)
}

/// Original name of a claimed file, if `name` carries the claim suffix
pub fn unclaimed(name: &str) -> Option<&str> {
    name.strip_suffix(CLAIM_SUFFIX)
}

/// Sort, cap and filter a listing
///
/// Files already carrying the claim suffix belong to an in-flight run and are
/// never candidates. The cap applies before filtering, in name order.
fn select(
    mut found: Vec<FileRecord>,
    pattern: &str,
    max_file_count: Option<usize>,
) -> (Vec<FileRecord>, Vec<FileRecord>) {
    found.retain(|f| unclaimed(&f.name).is_none());
    found.sort_by(|a, b| a.name.cmp(&b.name));
    if let Some(max) = max_file_count {
        found.truncate(max);
    }
    let matched = filter::filter_records(&found, pattern);
    (found, matched)
}

async fn connect(protocol: &mut dyn TransferProtocol) -> Result<(), PluginError> {
    if protocol.connect().await? {
        Ok(())
    } else {
        Err(PluginError::Connection(format!(
            "Could not connect to {}",
            protocol.describe()
        )))
    }
}

/// Connect, list the remote directory and apply the filter without transferring
pub async fn list_matching(
    protocol: &mut dyn TransferProtocol,
    file_filter: &str,
    max_file_count: Option<usize>,
) -> Result<(Vec<FileRecord>, Vec<FileRecord>), PluginError> {
    connect(protocol).await?;
    let listing = protocol.list_remote().await;
    if let Err(e) = protocol.disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
    Ok(select(listing?, file_filter, max_file_count))
}

/// Run one transfer step
///
/// Connection failure aborts the step. Per-file failures are recorded as
/// `error` events, the file's claim is restored and the file is reported in
/// `failed`; the remaining files still transfer. The session is always
/// released before returning.
#[instrument(skip_all, fields(
    run_id = %job.run_id,
    step_id = job.step_id,
    direction = job.direction.as_str(),
    remote = %protocol.describe()
))]
pub async fn run_transfer(
    protocol: &mut dyn TransferProtocol,
    job: &TransferJob<'_>,
) -> Result<TransferSummary, PluginError> {
    connect(protocol).await?;
    let result = transfer_all(protocol, job).await;
    if let Err(e) = protocol.disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
    result
}

async fn transfer_all(
    protocol: &mut dyn TransferProtocol,
    job: &TransferJob<'_>,
) -> Result<TransferSummary, PluginError> {
    let listing = match job.direction {
        Direction::Download => protocol.list_remote().await?,
        Direction::Upload => list_directory(job.staging_dir).await?,
    };
    let (found, matched) = select(listing, job.file_filter, job.max_file_count);
    info!(
        found = found.len(),
        matched = matched.len(),
        filter = %job.file_filter,
        "Selected files for transfer"
    );

    let mut summary = TransferSummary {
        found,
        matched: matched.clone(),
        ..Default::default()
    };

    for file in matched {
        let in_flight = NewFileEvent::new(
            job.run_id,
            job.task_id,
            job.step_id,
            &file,
            job.direction.in_flight_status(),
        );
        if let Err(e) = job.audit.record_file_event(in_flight).await {
            error!(file = %file.name, error = %e, "Failed to record file start");
            summary.failed.push(file.name.clone());
            continue;
        }

        let outcome = match job.direction {
            Direction::Download => download_one(protocol, job, &file).await,
            Direction::Upload => upload_one(protocol, job, &file).await,
        };

        match outcome {
            Ok(bytes) => {
                let done = NewFileEvent::new(
                    job.run_id,
                    job.task_id,
                    job.step_id,
                    &file,
                    job.direction.done_status(),
                )
                .with_size(Some(bytes));
                if let Err(e) = job.audit.record_file_event(done).await {
                    error!(file = %file.name, error = %e, "Failed to record file completion");
                }
                telemetry::record_file_transferred(job.direction, bytes);
                info!(file = %file.name, bytes = bytes, "File transferred");
                summary.done.push(file.with_size(Some(bytes)));
            }
            Err(e) => {
                warn!(file = %file.name, error = %e, "File transfer failed, skipping");
                let failed = NewFileEvent::new(
                    job.run_id,
                    job.task_id,
                    job.step_id,
                    &file,
                    FileStatus::Error,
                );
                if let Err(e) = job.audit.record_file_event(failed).await {
                    error!(file = %file.name, error = %e, "Failed to record file error");
                }
                telemetry::record_file_error(job.direction);
                summary.failed.push(file.name.clone());
            }
        }
    }

    Ok(summary)
}

/// Remote → staging for one file
///
/// The remote copy is claimed first and the bytes land under the claimed
/// name locally; the staged file only appears under its final name once
/// complete. The source claim is then deleted or restored.
async fn download_one(
    protocol: &mut dyn TransferProtocol,
    job: &TransferJob<'_>,
    file: &FileRecord,
) -> Result<u64, TransferError> {
    let remote_claim = claimed(&file.name);
    protocol.rename_remote(&file.name, &remote_claim).await?;

    let local_claim = job.staging_dir.join(&remote_claim);
    let local_final = job.staging_dir.join(&file.name);

    let copied = async {
        let bytes = protocol.download(&remote_claim, &local_claim).await?;
        rename_local(&local_claim, &local_final).await?;
        Ok::<u64, TransferError>(bytes)
    }
    .await;

    let bytes = match copied {
        Ok(bytes) => bytes,
        Err(e) => {
            discard_local(&local_claim).await;
            if let Err(restore) = protocol.rename_remote(&remote_claim, &file.name).await {
                error!(file = %file.name, error = %restore, "Failed to restore remote claim");
            }
            return Err(e);
        }
    };

    // The staged copy is complete; losing the release below leaves a visible
    // claim on the source but never loses data.
    let released = if job.delete_source {
        protocol.delete_remote(&remote_claim).await
    } else {
        protocol.rename_remote(&remote_claim, &file.name).await
    };
    if let Err(e) = released {
        warn!(file = %file.name, error = %e, "Failed to release remote claim");
    }

    Ok(bytes)
}

/// Staging → remote for one file
///
/// The staged copy is claimed, pushed under the claimed name and renamed into
/// place remotely. The staged copy is restored unless `delete_source` is set,
/// so later steps can push the same files elsewhere.
async fn upload_one(
    protocol: &mut dyn TransferProtocol,
    job: &TransferJob<'_>,
    file: &FileRecord,
) -> Result<u64, TransferError> {
    let local_final = job.staging_dir.join(&file.name);
    let local_claim = job.staging_dir.join(claimed(&file.name));
    rename_local(&local_final, &local_claim).await?;

    let remote_claim = claimed(&file.name);
    // A claim left behind by an interrupted run
    if protocol.delete_remote(&remote_claim).await.is_ok() {
        debug!(file = %remote_claim, "Removed stale remote claim");
    }

    let pushed = async {
        let bytes = protocol.upload(&local_claim, &remote_claim).await?;
        // Replace an earlier delivery of the same name
        if protocol.delete_remote(&file.name).await.is_ok() {
            debug!(file = %file.name, "Replaced existing remote file");
        }
        protocol.rename_remote(&remote_claim, &file.name).await?;
        Ok::<u64, TransferError>(bytes)
    }
    .await;

    let bytes = match pushed {
        Ok(bytes) => bytes,
        Err(e) => {
            if let Err(cleanup) = protocol.delete_remote(&remote_claim).await {
                debug!(file = %remote_claim, error = %cleanup, "No partial upload to remove");
            }
            if let Err(restore) = rename_local(&local_claim, &local_final).await {
                error!(file = %file.name, error = %restore, "Failed to restore staged file");
            }
            return Err(e);
        }
    };

    let released = if job.delete_source {
        tokio::fs::remove_file(&local_claim).await.map_err(TransferError::from)
    } else {
        rename_local(&local_claim, &local_final).await
    };
    if let Err(e) = released {
        warn!(file = %file.name, error = %e, "Failed to release staged file");
    }

    Ok(bytes)
}

/// Rename within the staging area, refusing to replace an existing file
async fn rename_local(from: &Path, to: &Path) -> Result<(), TransferError> {
    if tokio::fs::try_exists(to).await? {
        return Err(TransferError::remote(
            "rename",
            &from.display().to_string(),
            format!("{} already exists", to.display()),
        ));
    }
    tokio::fs::rename(from, to).await?;
    Ok(())
}

async fn discard_local(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial download"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::models::{Host, HostKind};
    use crate::protocol::LocalDirectory;

    fn local_host(dir: &Path) -> Host {
        Host {
            id: 1,
            name: "local".to_string(),
            kind: HostKind::LocalDirectory,
            host: None,
            port: None,
            directory: Some(dir.display().to_string()),
            share: None,
            username: None,
            password: None,
            description: None,
        }
    }

    fn job<'a>(
        direction: Direction,
        staging: &'a Path,
        filter: &'a str,
        audit: &'a InMemoryAuditLog,
        run_id: Uuid,
    ) -> TransferJob<'a> {
        TransferJob {
            direction,
            staging_dir: staging,
            file_filter: filter,
            max_file_count: None,
            delete_source: false,
            audit,
            run_id,
            task_id: 1,
            step_id: 10,
        }
    }

    #[test]
    fn test_unclaimed_strips_suffix_only() {
        assert_eq!(unclaimed("a.txt.processing"), Some("a.txt"));
        assert_eq!(unclaimed("a.txt"), None);
        assert_eq!(unclaimed("processing"), None);
    }

    #[test]
    fn test_select_skips_claims_caps_then_filters() {
        let listing = vec![
            FileRecord::new("c.txt"),
            FileRecord::new("a.csv"),
            FileRecord::new("b.txt.processing"),
            FileRecord::new("b.txt"),
        ];
        let (found, matched) = select(listing, "*.txt", Some(2));
        let found: Vec<&str> = found.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(found, vec!["a.csv", "b.txt"]);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "b.txt");
    }

    #[tokio::test]
    async fn test_download_moves_matching_files_and_restores_source() {
        let remote = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        std::fs::write(remote.path().join("report.txt"), b"report").unwrap();
        std::fs::write(remote.path().join("notes.csv"), b"notes").unwrap();

        let audit = InMemoryAuditLog::new();
        let run_id = Uuid::new_v4();
        let mut protocol = LocalDirectory::new(&local_host(remote.path()));
        let summary = run_transfer(
            &mut protocol,
            &job(Direction::Download, staging.path(), "*.txt", &audit, run_id),
        )
        .await
        .unwrap();

        assert_eq!(summary.found.len(), 2);
        assert_eq!(summary.done.len(), 1);
        assert_eq!(summary.done[0].size, Some(6));
        assert!(summary.failed.is_empty());
        assert!(staging.path().join("report.txt").exists());
        assert!(!staging.path().join("notes.csv").exists());
        // Source restored under its original name
        assert!(remote.path().join("report.txt").exists());
        assert!(!remote.path().join("report.txt.processing").exists());

        let events = audit.file_events(run_id).await.unwrap();
        let statuses: Vec<FileStatus> = events.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![FileStatus::Downloading, FileStatus::Downloaded]);
        assert_eq!(events[0].file_id, events[1].file_id);
        assert_eq!(events[1].size, Some(6));
    }

    #[tokio::test]
    async fn test_download_with_delete_removes_source() {
        let remote = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        std::fs::write(remote.path().join("a.txt"), b"a").unwrap();

        let audit = InMemoryAuditLog::new();
        let mut protocol = LocalDirectory::new(&local_host(remote.path()));
        let mut request = job(Direction::Download, staging.path(), "*.*", &audit, Uuid::new_v4());
        request.delete_source = true;
        run_transfer(&mut protocol, &request).await.unwrap();

        assert!(staging.path().join("a.txt").exists());
        assert_eq!(std::fs::read_dir(remote.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_download_collision_is_per_file_error() {
        let remote = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        std::fs::write(remote.path().join("a.txt"), b"new").unwrap();
        std::fs::write(remote.path().join("b.txt"), b"b").unwrap();
        std::fs::write(staging.path().join("a.txt"), b"old").unwrap();

        let audit = InMemoryAuditLog::new();
        let run_id = Uuid::new_v4();
        let mut protocol = LocalDirectory::new(&local_host(remote.path()));
        let summary = run_transfer(
            &mut protocol,
            &job(Direction::Download, staging.path(), "*.txt", &audit, run_id),
        )
        .await
        .unwrap();

        assert_eq!(summary.failed, vec!["a.txt".to_string()]);
        assert_eq!(summary.done.len(), 1);
        assert_eq!(std::fs::read(staging.path().join("a.txt")).unwrap(), b"old");
        assert!(!staging.path().join("a.txt.processing").exists());
        // Claim restored on the source
        assert!(remote.path().join("a.txt").exists());

        let events = audit.file_events(run_id).await.unwrap();
        assert!(events.iter().any(|e| e.status == FileStatus::Error && e.file_name == "a.txt"));
    }

    #[tokio::test]
    async fn test_upload_keeps_staged_copy_and_replaces_target() {
        let remote = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        std::fs::write(staging.path().join("report.txt"), b"fresh").unwrap();
        std::fs::write(remote.path().join("report.txt"), b"stale").unwrap();

        let audit = InMemoryAuditLog::new();
        let run_id = Uuid::new_v4();
        let mut protocol = LocalDirectory::new(&local_host(remote.path()));
        let summary = run_transfer(
            &mut protocol,
            &job(Direction::Upload, staging.path(), "*.txt", &audit, run_id),
        )
        .await
        .unwrap();

        assert_eq!(summary.done.len(), 1);
        assert_eq!(std::fs::read(remote.path().join("report.txt")).unwrap(), b"fresh");
        assert!(!remote.path().join("report.txt.processing").exists());
        assert!(staging.path().join("report.txt").exists());

        let events = audit.file_events(run_id).await.unwrap();
        let statuses: Vec<FileStatus> = events.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![FileStatus::Uploading, FileStatus::Uploaded]);
    }

    #[tokio::test]
    async fn test_connect_failure_aborts_without_events() {
        let staging = tempfile::tempdir().unwrap();
        let audit = InMemoryAuditLog::new();
        let run_id = Uuid::new_v4();
        let mut protocol = LocalDirectory::new(&local_host(Path::new("/nonexistent/remote")));
        let result = run_transfer(
            &mut protocol,
            &job(Direction::Download, staging.path(), "*.*", &audit, run_id),
        )
        .await;

        assert!(matches!(result, Err(PluginError::Connection(_))));
        assert!(audit.file_events(run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_matching_does_not_touch_files() {
        let remote = tempfile::tempdir().unwrap();
        std::fs::write(remote.path().join("a.txt"), b"a").unwrap();
        std::fs::write(remote.path().join("b.xml"), b"b").unwrap();

        let mut protocol = LocalDirectory::new(&local_host(remote.path()));
        let (found, matched) = list_matching(&mut protocol, "*.xml", None).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(matched[0].name, "b.xml");
        assert!(remote.path().join("b.xml").exists());
    }
}
