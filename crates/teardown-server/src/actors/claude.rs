use super::{parse_payload, Actor, PreparedInput, ValidationError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use teardown_core::envelope::ActorKind;
use teardown_core::pipeline::{PipelineError, TeardownPipeline};
use teardown_core::stream::StreamEmitter;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeardownRequest {
    repo_url: String,
    /// Focus hint appended to the analysis prompt on a cache miss only.
    /// Artifacts are cached per `(full_name, sha)`, so a later request with a
    /// different query replays whatever the first run produced.
    #[serde(default)]
    query: Option<String>,
}

/// Repository analysis: streams the cached or freshly generated teardown.
pub struct ClaudeActor {
    pipeline: Arc<TeardownPipeline>,
}

impl ClaudeActor {
    pub fn new(pipeline: Arc<TeardownPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Actor for ClaudeActor {
    fn kind(&self) -> ActorKind {
        ActorKind::Claude
    }

    fn validate_and_prepare(&self, data: &Value) -> Result<PreparedInput, ValidationError> {
        let request: TeardownRequest = parse_payload(data)?;
        let repo_url = request.repo_url.trim();
        if repo_url.is_empty() {
            return Err(ValidationError::Blank("repoUrl"));
        }
        Ok(PreparedInput::Teardown {
            repo_url: repo_url.to_string(),
            query: request.query.filter(|q| !q.trim().is_empty()),
        })
    }

    async fn produce(
        &self,
        input: PreparedInput,
        emitter: StreamEmitter,
        cancel: CancellationToken,
    ) {
        let PreparedInput::Teardown { repo_url, query } = input else {
            tracing::error!("Claude actor received a non-teardown input");
            return;
        };
        match self
            .pipeline
            .run(&repo_url, query.as_deref(), emitter, cancel)
            .await
        {
            Ok(outcome) => tracing::debug!("Teardown of {} complete", outcome.key),
            Err(PipelineError::Cancelled) => {
                tracing::info!("Teardown of {} cancelled", repo_url)
            }
            Err(e) => tracing::debug!("Teardown of {} ended with error: {}", repo_url, e),
        }
    }
}
