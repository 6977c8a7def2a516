//! Repository acquisition into scoped working directories.

use crate::metadata::RepositoryMetadata;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("Failed to create working directory under {root}: {source}")]
    WorkingDirectory {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git clone of {url} failed: {stderr}")]
    CloneFailed { url: String, stderr: String },
}

/// An ephemeral directory holding one acquired repository.
///
/// Call [`WorkingDirectory::release`] on every exit path. Dropping the guard
/// without releasing removes the directory synchronously.
#[derive(Debug)]
pub struct WorkingDirectory {
    dir: TempDir,
    checkout: PathBuf,
}

impl WorkingDirectory {
    /// Create an empty `repo-teardown-*` directory under `root`.
    pub fn create_in(root: &Path) -> Result<Self, AcquisitionError> {
        std::fs::create_dir_all(root).map_err(|source| AcquisitionError::WorkingDirectory {
            root: root.to_path_buf(),
            source,
        })?;
        let dir = tempfile::Builder::new()
            .prefix("repo-teardown-")
            .tempdir_in(root)
            .map_err(|source| AcquisitionError::WorkingDirectory {
                root: root.to_path_buf(),
                source,
            })?;
        let checkout = dir.path().join("repo");
        Ok(Self { dir, checkout })
    }

    /// Root of the scoped directory.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Directory the repository is (or will be) checked out into.
    pub fn path(&self) -> &Path {
        &self.checkout
    }

    /// Commit checked out in [`WorkingDirectory::path`], if it is a git
    /// repository.
    pub async fn head_sha(&self) -> Option<String> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.checkout)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!sha.is_empty()).then_some(sha)
    }

    /// Remove the directory. Failures are logged and otherwise ignored.
    pub async fn release(self) {
        let root = self.dir.path().to_path_buf();
        let dir = self.dir;
        match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => tracing::debug!("Removed working directory {}", root.display()),
            Ok(Err(e)) => tracing::warn!(
                "Failed to remove working directory {}: {}",
                root.display(),
                e
            ),
            Err(e) => tracing::warn!(
                "Cleanup task for {} did not complete: {}",
                root.display(),
                e
            ),
        }
    }
}

#[async_trait]
pub trait RepositoryAcquirer: Send + Sync {
    /// Obtain a local working copy of the repository.
    async fn acquire(
        &self,
        metadata: &RepositoryMetadata,
        shallow: bool,
    ) -> Result<WorkingDirectory, AcquisitionError>;
}

/// Acquires repositories with `git clone`.
#[derive(Debug, Clone)]
pub struct GitCloneAcquirer {
    root: PathBuf,
}

impl GitCloneAcquirer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl RepositoryAcquirer for GitCloneAcquirer {
    async fn acquire(
        &self,
        metadata: &RepositoryMetadata,
        shallow: bool,
    ) -> Result<WorkingDirectory, AcquisitionError> {
        let workdir = WorkingDirectory::create_in(&self.root)?;

        let mut cmd = Command::new("git");
        cmd.arg("clone");
        if shallow {
            cmd.args(["--depth", "1", "--single-branch"]);
        }
        cmd.args(["--branch", &metadata.default_branch])
            .arg(&metadata.clone_url)
            .arg(workdir.path())
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        tracing::info!(
            "Cloning {} ({}) into {}",
            metadata.full_name,
            metadata.default_branch,
            workdir.root().display()
        );

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => {
                workdir.release().await;
                return Err(AcquisitionError::Spawn(e));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            workdir.release().await;
            return Err(AcquisitionError::CloneFailed {
                url: metadata.clone_url.clone(),
                stderr,
            });
        }

        // The branch may have moved since metadata was fetched; the artifact
        // is still cached under the metadata sha.
        match workdir.head_sha().await {
            Some(head) if head != metadata.latest_commit.sha => tracing::warn!(
                "Clone of {} is at {} but metadata reported {}",
                metadata.full_name,
                head,
                metadata.latest_commit.sha
            ),
            Some(_) => {}
            None => tracing::warn!(
                "Could not read the checked out commit of {}",
                metadata.full_name
            ),
        }

        Ok(workdir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::CommitInfo;

    fn metadata(clone_url: &str) -> RepositoryMetadata {
        RepositoryMetadata {
            full_name: "octo/widget".into(),
            owner: "octo".into(),
            name: "widget".into(),
            description: None,
            default_branch: "main".into(),
            clone_url: clone_url.into(),
            html_url: None,
            size: 1,
            stargazers: 0,
            forks: 0,
            language: None,
            private: false,
            fork: false,
            archived: false,
            disabled: false,
            latest_commit: CommitInfo {
                sha: "abc".into(),
                message: String::new(),
                author: None,
                date: None,
            },
        }
    }

    fn entries(root: &Path) -> usize {
        std::fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_working_directory_release_removes_it() {
        let root = tempfile::tempdir().unwrap();
        let workdir = WorkingDirectory::create_in(root.path()).unwrap();
        std::fs::create_dir_all(workdir.path()).unwrap();
        std::fs::write(workdir.path().join("file.txt"), "x").unwrap();
        let created = workdir.root().to_path_buf();
        assert!(created
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("repo-teardown-"));

        workdir.release().await;
        assert!(!created.exists());
    }

    #[test]
    fn test_working_directory_drop_removes_it() {
        let root = tempfile::tempdir().unwrap();
        {
            let _workdir = WorkingDirectory::create_in(root.path()).unwrap();
            assert_eq!(entries(root.path()), 1);
        }
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_head_sha_of_plain_directory_is_none() {
        let root = tempfile::tempdir().unwrap();
        let workdir = WorkingDirectory::create_in(root.path()).unwrap();
        std::fs::create_dir_all(workdir.path()).unwrap();
        assert_eq!(workdir.head_sha().await, None);
        workdir.release().await;
    }

    #[tokio::test]
    async fn test_failed_clone_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let acquirer = GitCloneAcquirer::new(root.path());
        let missing = root.path().join("no-such-repo");
        let result = acquirer
            .acquire(&metadata(&missing.to_string_lossy()), true)
            .await;
        assert!(result.is_err());
        assert_eq!(entries(root.path()), 0);
    }
}
