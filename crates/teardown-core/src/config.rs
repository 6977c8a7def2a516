//! Service configuration.
//!
//! Loaded once at startup from an optional YAML file, then overridden by
//! environment variables. There is no live reconfiguration.

use crate::chat::OpenAiConfig;
use crate::generator::ClaudeGeneratorConfig;
use crate::metadata::GitHubConfig;
use crate::object_storage::{ObjectStorageConfig, DEFAULT_OBJECT_PREFIX};
use crate::pipeline::{AcceptancePolicy, PipelineConfig, DEFAULT_ANALYSIS_PROMPT};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Chat model used by each conversational actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub assistant: String,
    pub coder: String,
    pub writer: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            assistant: "gpt-4o".to_string(),
            coder: "gpt-5".to_string(),
            writer: "gpt-4o".to_string(),
        }
    }
}

/// Object-store settings; present only when a bucket is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    #[serde(default = "default_object_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_object_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub addr: SocketAddr,
    pub max_repo_size_mb: u64,
    /// Generation ceiling, in seconds.
    pub operation_timeout: u64,
    pub workdir: PathBuf,
    pub data_dir: PathBuf,
    pub chunk_bytes: usize,
    pub bucket: Option<BucketConfig>,
    pub github_token: Option<String>,
    pub github_api_url: String,
    pub openai_api_key: Option<String>,
    pub openai_api_base: String,
    pub claude_path: String,
    pub claude_model: Option<String>,
    pub models: ModelConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            max_repo_size_mb: 100,
            operation_timeout: 3600,
            workdir: std::env::temp_dir(),
            data_dir: PathBuf::from("data"),
            chunk_bytes: 1000,
            bucket: None,
            github_token: None,
            github_api_url: GitHubConfig::default().api_url,
            openai_api_key: None,
            openai_api_base: OpenAiConfig::default().api_base,
            claude_path: "claude".to_string(),
            claude_model: None,
            models: ModelConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from `path` (defaults if missing) and apply the process environment.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(path).await?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load the YAML file alone, returning defaults if it doesn't exist.
    pub async fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: ServiceConfig = serde_yaml::from_str(&content)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = var("TEARDOWN_ADDR") {
            self.addr = parse_value("TEARDOWN_ADDR", &value)?;
        }
        if let Some(value) = var("MAX_REPO_SIZE_MB") {
            self.max_repo_size_mb = parse_value("MAX_REPO_SIZE_MB", &value)?;
        }
        if let Some(value) = var("OPERATION_TIMEOUT") {
            self.operation_timeout = parse_value("OPERATION_TIMEOUT", &value)?;
        }
        if let Some(value) = var("TEARDOWN_CHUNK_BYTES") {
            self.chunk_bytes = parse_value("TEARDOWN_CHUNK_BYTES", &value)?;
        }
        if let Some(value) = var("TEARDOWN_WORKDIR") {
            self.workdir = PathBuf::from(value);
        }
        if let Some(value) = var("TEARDOWN_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(name) = var("BUCKET_NAME") {
            let mut bucket = self.bucket.take().unwrap_or(BucketConfig {
                name: String::new(),
                endpoint: default_object_endpoint(),
                token: None,
            });
            bucket.name = name;
            self.bucket = Some(bucket);
        }
        if let Some(bucket) = self.bucket.as_mut() {
            if let Some(endpoint) = var("TEARDOWN_OBJECT_ENDPOINT") {
                bucket.endpoint = endpoint;
            }
            if let Some(token) = var("TEARDOWN_OBJECT_TOKEN") {
                bucket.token = Some(token);
            }
        }
        if let Some(value) = var("GITHUB_TOKEN") {
            self.github_token = Some(value);
        }
        if let Some(value) = var("GITHUB_API_URL") {
            self.github_api_url = value;
        }
        if let Some(value) = var("OPENAI_API_KEY") {
            self.openai_api_key = Some(value);
        }
        if let Some(value) = var("OPENAI_API_BASE") {
            self.openai_api_base = value;
        }
        if let Some(value) = var("CLAUDE_PATH") {
            self.claude_path = value;
        }
        if let Some(value) = var("CLAUDE_MODEL") {
            self.claude_model = Some(value);
        }

        if self.chunk_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "chunk_bytes".to_string(),
                value: "0".to_string(),
            });
        }
        if self.operation_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                key: "operation_timeout".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            policy: AcceptancePolicy::from_megabytes(self.max_repo_size_mb),
            generation_timeout: Duration::from_secs(self.operation_timeout),
            chunk_bytes: self.chunk_bytes,
            prompt: DEFAULT_ANALYSIS_PROMPT.to_string(),
        }
    }

    pub fn github(&self) -> GitHubConfig {
        GitHubConfig {
            api_url: self.github_api_url.clone(),
            token: self.github_token.clone(),
        }
    }

    pub fn openai(&self) -> OpenAiConfig {
        OpenAiConfig {
            api_key: self.openai_api_key.clone(),
            api_base: self.openai_api_base.clone(),
        }
    }

    pub fn claude(&self) -> ClaudeGeneratorConfig {
        ClaudeGeneratorConfig {
            claude_path: self.claude_path.clone(),
            model: self.claude_model.clone(),
            extra_args: Vec::new(),
        }
    }

    pub fn object_storage(&self) -> Option<ObjectStorageConfig> {
        self.bucket.as_ref().map(|bucket| ObjectStorageConfig {
            endpoint: bucket.endpoint.clone(),
            bucket: bucket.name.clone(),
            prefix: DEFAULT_OBJECT_PREFIX.to_string(),
            token: bucket.token.clone(),
        })
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.addr.port(), 3000);
        assert_eq!(config.max_repo_size_mb, 100);
        assert_eq!(config.operation_timeout, 3600);
        assert_eq!(config.chunk_bytes, 1000);
        assert!(config.bucket.is_none());
        assert_eq!(config.pipeline().policy.max_size_kb, 100 * 1024);
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::load_file(&dir.path().join("nope.yaml"))
            .await
            .unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[tokio::test]
    async fn test_yaml_file_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("teardown.yaml");
        std::fs::write(
            &path,
            "max_repo_size_mb: 5\nmodels:\n  writer: gpt-5\nbucket:\n  name: analyses\n",
        )
        .unwrap();

        let config = ServiceConfig::load_file(&path).await.unwrap();
        assert_eq!(config.max_repo_size_mb, 5);
        assert_eq!(config.models.writer, "gpt-5");
        assert_eq!(config.models.assistant, "gpt-4o");
        let storage = config.object_storage().unwrap();
        assert_eq!(storage.bucket, "analyses");
        assert_eq!(storage.prefix, "teardown/");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServiceConfig::default();
        config
            .apply_env(env(&[
                ("TEARDOWN_ADDR", "127.0.0.1:8080"),
                ("MAX_REPO_SIZE_MB", "7"),
                ("OPERATION_TIMEOUT", "60"),
                ("BUCKET_NAME", "cache"),
                ("TEARDOWN_OBJECT_TOKEN", "secret"),
                ("CLAUDE_MODEL", "claude-sonnet"),
                ("GITHUB_TOKEN", ""),
            ]))
            .unwrap();
        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.pipeline().generation_timeout, Duration::from_secs(60));
        assert_eq!(config.pipeline().policy.max_size_kb, 7 * 1024);
        assert_eq!(config.bucket.as_ref().unwrap().token.as_deref(), Some("secret"));
        assert_eq!(config.claude().model.as_deref(), Some("claude-sonnet"));
        assert!(config.github_token.is_none());
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_env(env(&[("OPERATION_TIMEOUT", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "OPERATION_TIMEOUT"));

        let mut config = ServiceConfig::default();
        assert!(config
            .apply_env(env(&[("TEARDOWN_CHUNK_BYTES", "0")]))
            .is_err());
    }

    #[test]
    fn test_zero_operation_timeout_is_rejected() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_env(env(&[("OPERATION_TIMEOUT", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "operation_timeout"));

        let mut config = ServiceConfig {
            operation_timeout: 0,
            ..ServiceConfig::default()
        };
        assert!(config.apply_env(env(&[])).is_err());
    }
}
