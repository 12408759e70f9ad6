// Staging area manager
// One isolated working directory per task run, named by the run id

use crate::errors::StagingError;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Creates and removes per-run staging directories under a shared root
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

/// Outcome of a conditional teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Removed,
    /// Left in place so an operator can inspect residual files
    Kept { residual_files: usize },
    /// Nothing to remove
    Missing,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a run stages its files in
    pub fn path_for(&self, run_id: &Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Create the staging directory for a run
    ///
    /// Fails with `AlreadyExists` when the directory is already present: run
    /// ids are random per run, so a collision means an id was reused.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn create(&self, run_id: &Uuid) -> Result<PathBuf, StagingError> {
        let path = self.path_for(run_id);

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;

        // create_dir (not create_dir_all) so an existing directory is an error
        tokio::fs::create_dir(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                StagingError::AlreadyExists(path.display().to_string())
            } else {
                io_error(&path, e)
            }
        })?;

        info!(path = %path.display(), "Created staging directory");
        Ok(path)
    }

    /// Recursively remove a staging directory and its contents
    #[instrument(skip(self))]
    pub async fn destroy(&self, path: &Path) -> Result<(), StagingError> {
        remove_directory(path).await
    }

    /// Remove the directory unless the run failed and left files behind
    pub async fn teardown(&self, path: &Path, run_failed: bool) -> Result<Teardown, StagingError> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| io_error(path, e))?
        {
            return Ok(Teardown::Missing);
        }

        if run_failed {
            let residual_files = count_entries(path).await?;
            if residual_files > 0 {
                warn!(
                    path = %path.display(),
                    residual_files = residual_files,
                    "Keeping staging directory of failed run for inspection"
                );
                return Ok(Teardown::Kept { residual_files });
            }
        }

        self.destroy(path).await?;
        Ok(Teardown::Removed)
    }
}

/// Remove `path` recursively; a missing directory is not an error
pub async fn remove_directory(path: &Path) -> Result<(), StagingError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            info!(path = %path.display(), "Removed staging directory");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Staging directory already removed");
            Ok(())
        }
        Err(e) => Err(io_error(path, e)),
    }
}

/// Number of entries directly inside `path`
pub async fn count_entries(path: &Path) -> Result<usize, StagingError> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| io_error(path, e))?;
    let mut count = 0;
    while entries
        .next_entry()
        .await
        .map_err(|e| io_error(path, e))?
        .is_some()
    {
        count += 1;
    }
    Ok(count)
}

pub(crate) fn io_error(path: &Path, source: std::io::Error) -> StagingError {
    StagingError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_derives_path_from_root_and_run_id() {
        let root = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(root.path());
        let run_id = Uuid::new_v4();

        let path = staging.create(&run_id).await.unwrap();

        assert_eq!(path, root.path().join(run_id.to_string()));
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn test_create_fails_when_directory_exists() {
        let root = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(root.path());
        let run_id = Uuid::new_v4();

        staging.create(&run_id).await.unwrap();
        let err = staging.create(&run_id).await.unwrap_err();

        assert!(matches!(err, StagingError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_create_makes_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(root.path().join("nested").join("work"));
        let path = staging.create(&Uuid::new_v4()).await.unwrap();
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn test_destroy_removes_contents() {
        let root = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(root.path());
        let path = staging.create(&Uuid::new_v4()).await.unwrap();
        std::fs::write(path.join("report.txt"), b"data").unwrap();

        staging.destroy(&path).await.unwrap();
        assert!(!path.exists());

        // Second destroy is a no-op
        staging.destroy(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_keeps_residual_files_after_failure() {
        let root = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(root.path());
        let path = staging.create(&Uuid::new_v4()).await.unwrap();
        std::fs::write(path.join("report.txt"), b"data").unwrap();

        let outcome = staging.teardown(&path, true).await.unwrap();

        assert_eq!(outcome, Teardown::Kept { residual_files: 1 });
        assert!(path.join("report.txt").exists());
    }

    #[tokio::test]
    async fn test_teardown_removes_empty_directory_after_failure() {
        let root = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(root.path());
        let path = staging.create(&Uuid::new_v4()).await.unwrap();

        assert_eq!(staging.teardown(&path, true).await.unwrap(), Teardown::Removed);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_teardown_removes_files_after_success() {
        let root = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(root.path());
        let path = staging.create(&Uuid::new_v4()).await.unwrap();
        std::fs::write(path.join("report.txt"), b"data").unwrap();

        assert_eq!(staging.teardown(&path, false).await.unwrap(), Teardown::Removed);
        assert_eq!(staging.teardown(&path, false).await.unwrap(), Teardown::Missing);
    }
}
