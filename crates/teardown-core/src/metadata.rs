//! Repository metadata lookup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Repository {full_name} is not accessible (status {status:?}): {message}")]
    NotAccessible {
        full_name: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Failed to decode metadata for {full_name}: {message}")]
    Decode { full_name: String, message: String },
}

/// Most recent commit on the default branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

/// Resolved facts about a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    pub full_name: String,
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub default_branch: String,
    pub clone_url: String,
    #[serde(default)]
    pub html_url: Option<String>,
    /// Size in kilobytes, as reported by the host.
    pub size: u64,
    #[serde(default)]
    pub stargazers: u64,
    #[serde(default)]
    pub forks: u64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub disabled: bool,
    pub latest_commit: CommitInfo,
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn get_metadata(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<RepositoryMetadata, MetadataError>;
}

/// Configuration for the GitHub REST metadata client.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_url: String,
    pub token: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: None,
        }
    }
}

pub struct GitHubMetadataClient {
    config: GitHubConfig,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GitHubRepo {
    full_name: String,
    name: String,
    owner: GitHubOwner,
    #[serde(default)]
    description: Option<String>,
    default_branch: String,
    clone_url: String,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    fork: bool,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Deserialize)]
struct GitHubOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GitHubCommit {
    sha: String,
    commit: GitHubCommitDetail,
}

#[derive(Debug, Deserialize)]
struct GitHubCommitDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    author: Option<GitHubSignature>,
}

#[derive(Debug, Deserialize)]
struct GitHubSignature {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

impl GitHubMetadataClient {
    pub fn new(config: GitHubConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        full_name: &str,
        path: &str,
    ) -> Result<T, MetadataError> {
        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), path);
        let mut request = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "repo-teardown");
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| MetadataError::NotAccessible {
            full_name: full_name.to_string(),
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MetadataError::NotAccessible {
                full_name: full_name.to_string(),
                status: Some(status.as_u16()),
                message: body,
            });
        }

        response.json::<T>().await.map_err(|e| MetadataError::Decode {
            full_name: full_name.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl MetadataSource for GitHubMetadataClient {
    async fn get_metadata(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<RepositoryMetadata, MetadataError> {
        let full_name = format!("{}/{}", owner, name);
        let repo: GitHubRepo = self
            .get_json(&full_name, &format!("repos/{}", full_name))
            .await?;
        let commit: GitHubCommit = self
            .get_json(
                &full_name,
                &format!("repos/{}/commits/{}", full_name, repo.default_branch),
            )
            .await?;

        Ok(repo.into_metadata(commit))
    }
}

impl GitHubRepo {
    fn into_metadata(self, commit: GitHubCommit) -> RepositoryMetadata {
        let (author, date) = match commit.commit.author {
            Some(sig) => (sig.name, sig.date),
            None => (None, None),
        };
        RepositoryMetadata {
            full_name: self.full_name,
            owner: self.owner.login,
            name: self.name,
            description: self.description,
            default_branch: self.default_branch,
            clone_url: self.clone_url,
            html_url: self.html_url,
            size: self.size,
            stargazers: self.stargazers_count,
            forks: self.forks_count,
            language: self.language,
            private: self.private,
            fork: self.fork,
            archived: self.archived,
            disabled: self.disabled,
            latest_commit: CommitInfo {
                sha: commit.sha,
                message: commit.commit.message,
                author,
                date,
            },
        }
    }
}
