//! Object-store adaptor over a plain HTTP object API.
//!
//! Objects are addressed as `{endpoint}/{bucket}/{prefix}{key}` (the layout of
//! the GCS XML API and S3 path-style URLs). Requests carry an optional bearer
//! token.

use crate::storage::{
    ArtifactRef, ArtifactStream, CacheKey, StorageAdaptor, StorageError, ARTIFACT_FILE,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use std::path::Path;

pub const DEFAULT_OBJECT_PREFIX: &str = "teardown/";

#[derive(Debug, Clone)]
pub struct ObjectStorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub prefix: String,
    pub token: Option<String>,
}

impl ObjectStorageConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            endpoint: "https://storage.googleapis.com".to_string(),
            bucket: bucket.into(),
            prefix: DEFAULT_OBJECT_PREFIX.to_string(),
            token: None,
        }
    }
}

pub struct ObjectStorage {
    config: ObjectStorageConfig,
    http: reqwest::Client,
}

impl ObjectStorage {
    pub fn new(config: ObjectStorageConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn object_name(&self, key_prefix: &str, file: &str) -> String {
        let prefix = key_prefix.trim_matches('/');
        if file.is_empty() {
            format!("{}{}/", self.config.prefix, prefix)
        } else {
            format!("{}{}/{}", self.config.prefix, prefix, file)
        }
    }

    fn url(&self, object: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket,
            object
        )
    }

    fn request(&self, method: reqwest::Method, object: &str) -> reqwest::RequestBuilder {
        let request = self.http.request(method, self.url(object));
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn put(&self, object: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let response = self
            .request(reqwest::Method::PUT, object)
            .header("Content-Type", "text/markdown")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::Status {
                status: response.status().as_u16(),
                object: object.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdaptor for ObjectStorage {
    async fn create_namespace(&self, key_prefix: &str) -> Result<(), StorageError> {
        let object = self.object_name(key_prefix, "");
        self.put(&object, Vec::new()).await
    }

    async fn find(&self, key: &CacheKey) -> Result<Option<ArtifactRef>, StorageError> {
        let object = self.object_name(&key.prefix(), ARTIFACT_FILE);
        let response = self.request(reqwest::Method::HEAD, &object).send().await?;
        match response.status() {
            status if status.is_success() => Ok(Some(ArtifactRef::Object {
                bucket: self.config.bucket.clone(),
                object,
            })),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(StorageError::Status {
                status: status.as_u16(),
                object,
            }),
        }
    }

    async fn persist(&self, local: &Path, key: &CacheKey) -> Result<ArtifactRef, StorageError> {
        let body = tokio::fs::read(local).await.map_err(|source| StorageError::Io {
            path: local.display().to_string(),
            source,
        })?;
        let object = self.object_name(&key.prefix(), ARTIFACT_FILE);
        self.put(&object, body).await?;
        tracing::debug!("Uploaded {} to {}", local.display(), self.url(&object));
        Ok(ArtifactRef::Object {
            bucket: self.config.bucket.clone(),
            object,
        })
    }

    async fn open_for_read(&self, artifact: &ArtifactRef) -> Result<ArtifactStream, StorageError> {
        let ArtifactRef::Object { object, .. } = artifact else {
            return Err(StorageError::NotFound(artifact.to_string()));
        };
        let response = self.request(reqwest::Method::GET, object).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other))
                .boxed()),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(artifact.to_string())),
            status => Err(StorageError::Status {
                status: status.as_u16(),
                object: object.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> ObjectStorage {
        ObjectStorage::new(ObjectStorageConfig {
            endpoint: "https://objects.example.com/".to_string(),
            ..ObjectStorageConfig::new("analyses")
        })
    }

    #[test]
    fn test_object_layout() {
        let storage = storage();
        let key = CacheKey::new("octo/widget", "abc123");
        let object = storage.object_name(&key.prefix(), ARTIFACT_FILE);
        assert_eq!(object, "teardown/octo/widget/abc123/analysis.md");
        assert_eq!(
            storage.url(&object),
            "https://objects.example.com/analyses/teardown/octo/widget/abc123/analysis.md"
        );
        assert_eq!(
            storage.object_name("octo/widget/", ""),
            "teardown/octo/widget/"
        );
    }

    #[tokio::test]
    async fn test_local_reference_is_rejected() {
        let storage = storage();
        let artifact = ArtifactRef::Local("/tmp/analysis.md".into());
        assert!(matches!(
            storage.open_for_read(&artifact).await,
            Err(StorageError::NotFound(_))
        ));
    }
}
