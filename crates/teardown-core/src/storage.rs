//! Cache-keyed artifact storage.
//!
//! The adaptor is a pure key/artifact store: it knows nothing about envelopes
//! or streams. Keys are `(full_name, sha)` and therefore immutable in
//! practice; persisting twice to one key overwrites.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::io::ReaderStream;

/// File name of the analysis artifact inside a key's namespace.
pub const ARTIFACT_FILE: &str = "analysis.md";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Object store request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Object store returned status {status} for {object}")]
    Status { status: u16, object: String },
}

impl StorageError {
    fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Identifies one cached analysis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub full_name: String,
    pub sha: String,
}

impl CacheKey {
    pub fn new(full_name: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            sha: sha.into(),
        }
    }

    /// `<owner>/<repo>/<sha>`.
    pub fn prefix(&self) -> String {
        format!("{}/{}", self.full_name, self.sha)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.full_name, self.sha)
    }
}

/// Where a stored artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    Local(PathBuf),
    Object { bucket: String, object: String },
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactRef::Local(path) => write!(f, "{}", path.display()),
            ArtifactRef::Object { bucket, object } => write!(f, "{}/{}", bucket, object),
        }
    }
}

pub type ArtifactStream = BoxStream<'static, std::io::Result<Bytes>>;

#[async_trait]
pub trait StorageAdaptor: Send + Sync {
    /// Make sure the namespace for a key prefix exists.
    async fn create_namespace(&self, key_prefix: &str) -> Result<(), StorageError>;

    /// Look up the artifact stored for a key.
    async fn find(&self, key: &CacheKey) -> Result<Option<ArtifactRef>, StorageError>;

    /// Store a local file as the artifact for a key.
    async fn persist(&self, local: &Path, key: &CacheKey) -> Result<ArtifactRef, StorageError>;

    /// Open a stored artifact for reading.
    async fn open_for_read(&self, artifact: &ArtifactRef) -> Result<ArtifactStream, StorageError>;
}

/// Stores artifacts under a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.prefix()).join(ARTIFACT_FILE)
    }
}

#[async_trait]
impl StorageAdaptor for LocalStorage {
    async fn create_namespace(&self, key_prefix: &str) -> Result<(), StorageError> {
        let dir = self.root.join(key_prefix);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))
    }

    async fn find(&self, key: &CacheKey) -> Result<Option<ArtifactRef>, StorageError> {
        let path = self.artifact_path(key);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ArtifactRef::Local(path))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    async fn persist(&self, local: &Path, key: &CacheKey) -> Result<ArtifactRef, StorageError> {
        self.create_namespace(&key.prefix()).await?;
        let target = self.artifact_path(key);
        let staging = target.with_extension(format!("md.{}.tmp", uuid::Uuid::new_v4()));

        tokio::fs::copy(local, &staging)
            .await
            .map_err(|e| StorageError::io(local, e))?;
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(StorageError::io(&target, e));
        }

        Ok(ArtifactRef::Local(target))
    }

    async fn open_for_read(&self, artifact: &ArtifactRef) -> Result<ArtifactStream, StorageError> {
        let ArtifactRef::Local(path) = artifact else {
            return Err(StorageError::NotFound(artifact.to_string()));
        };
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(artifact.to_string()))
            }
            Err(e) => return Err(StorageError::io(path, e)),
        };
        Ok(ReaderStream::new(file).boxed())
    }
}

/// Collect an artifact stream into memory.
pub async fn read_all(mut stream: ArtifactStream) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::new("octo/widget", "abc123")
    }

    #[test]
    fn test_cache_key_prefix() {
        assert_eq!(key().prefix(), "octo/widget/abc123");
        assert_eq!(key().to_string(), "octo/widget@abc123");
    }

    #[tokio::test]
    async fn test_find_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(storage.find(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_then_find_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("data"));
        let source = dir.path().join("report.md");
        std::fs::write(&source, "# Report\nbody").unwrap();

        let stored = storage.persist(&source, &key()).await.unwrap();
        assert_eq!(
            stored,
            ArtifactRef::Local(dir.path().join("data/octo/widget/abc123/analysis.md"))
        );
        assert_eq!(storage.find(&key()).await.unwrap(), Some(stored.clone()));

        let bytes = read_all(storage.open_for_read(&stored).await.unwrap())
            .await
            .unwrap();
        assert_eq!(bytes, b"# Report\nbody");
    }

    #[tokio::test]
    async fn test_persist_twice_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("data"));
        let source = dir.path().join("report.md");

        std::fs::write(&source, "first").unwrap();
        storage.persist(&source, &key()).await.unwrap();
        std::fs::write(&source, "second").unwrap();
        let stored = storage.persist(&source, &key()).await.unwrap();

        let bytes = read_all(storage.open_for_read(&stored).await.unwrap())
            .await
            .unwrap();
        assert_eq!(bytes, b"second");
        let namespace = dir.path().join("data/octo/widget/abc123");
        assert_eq!(std::fs::read_dir(namespace).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_create_namespace_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.create_namespace("octo/widget").await.unwrap();
        storage.create_namespace("octo/widget").await.unwrap();
        assert!(dir.path().join("octo/widget").is_dir());
    }

    #[tokio::test]
    async fn test_open_vanished_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let artifact = ArtifactRef::Local(dir.path().join("gone.md"));
        assert!(matches!(
            storage.open_for_read(&artifact).await,
            Err(StorageError::NotFound(_))
        ));
    }
}
