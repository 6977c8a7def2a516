//! Cache-keyed repository teardown pipeline.
//!
//! For a repository reference the pipeline resolves metadata, applies the
//! acceptance policy and looks up `(full_name, sha)` in storage. A hit
//! replays the stored analysis; a miss clones the repository into a scoped
//! working directory, runs the generation step, persists the result and then
//! replays it. Either way the client sees the same chunk/end shape.

use crate::acquisition::{AcquisitionError, RepositoryAcquirer, WorkingDirectory};
use crate::envelope::{ErrorCode, ErrorDetails};
use crate::events::GenerationChunk;
use crate::generator::{GenerationError, Generator};
use crate::metadata::{MetadataError, MetadataSource, RepositoryMetadata};
use crate::reference::{ReferenceError, RepoReference};
use crate::storage::{ArtifactRef, ArtifactStream, CacheKey, StorageAdaptor, StorageError, ARTIFACT_FILE};
use crate::stream::{EmitError, StreamEmitter};
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_ANALYSIS_PROMPT: &str = "You are reviewing the repository checked out in the current directory. \
Produce a technical teardown of it: purpose, architecture and main components, \
how data flows through the system, notable dependencies, build and test setup, \
and any risks or quality concerns you find. Write the complete report in Markdown \
to a file named analysis.md in the current directory.";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidReference(#[from] ReferenceError),

    #[error(transparent)]
    NotAccessible(#[from] MetadataError),

    #[error("Repository {full_name} is {size_kb} KB, above the {limit_kb} KB limit")]
    TooLarge {
        full_name: String,
        size_kb: u64,
        limit_kb: u64,
    },

    #[error("Repository {0} is disabled")]
    Disabled(String),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Generation did not finish within {0:?}")]
    GenerationTimeout(Duration),

    #[error("Failed to prepare artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read artifact: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to stream artifact: {0}")]
    Read(#[source] std::io::Error),

    #[error("Stream cancelled")]
    Cancelled,

    #[error(transparent)]
    Emit(#[from] EmitError),
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::InvalidReference(_) => ErrorCode::InvalidReference,
            PipelineError::NotAccessible(_) => ErrorCode::NotAccessible,
            PipelineError::TooLarge { .. } => ErrorCode::TooLarge,
            PipelineError::Disabled(_) => ErrorCode::Disabled,
            PipelineError::Acquisition(_) => ErrorCode::AcquisitionFailed,
            PipelineError::Generation(_) => ErrorCode::GenerationFailed,
            PipelineError::GenerationTimeout(_) => ErrorCode::GenerationTimeout,
            PipelineError::Cancelled => ErrorCode::Cancelled,
            PipelineError::Artifact { .. }
            | PipelineError::Storage(_)
            | PipelineError::Read(_)
            | PipelineError::Emit(_) => ErrorCode::InternalError,
        }
    }

    pub fn to_details(&self) -> ErrorDetails {
        let details = ErrorDetails::new(self.code(), self.to_string());
        match self {
            PipelineError::TooLarge {
                size_kb, limit_kb, ..
            } => details.with_details(json!({ "sizeKb": size_kb, "limitKb": limit_kb })),
            _ => details,
        }
    }
}

/// Which repositories the pipeline agrees to analyse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptancePolicy {
    pub max_size_kb: u64,
}

impl AcceptancePolicy {
    pub fn from_megabytes(max_size_mb: u64) -> Self {
        Self {
            max_size_kb: max_size_mb.saturating_mul(1024),
        }
    }

    /// Reject oversized or disabled repositories. Archived ones only warn.
    pub fn check(&self, metadata: &RepositoryMetadata) -> Result<(), PipelineError> {
        if metadata.size > self.max_size_kb {
            return Err(PipelineError::TooLarge {
                full_name: metadata.full_name.clone(),
                size_kb: metadata.size,
                limit_kb: self.max_size_kb,
            });
        }
        if metadata.disabled {
            return Err(PipelineError::Disabled(metadata.full_name.clone()));
        }
        if metadata.archived {
            tracing::warn!("Repository {} is archived", metadata.full_name);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub policy: AcceptancePolicy,
    /// Ceiling for the generation step.
    pub generation_timeout: Duration,
    /// Maximum bytes per emitted chunk.
    pub chunk_bytes: usize,
    pub prompt: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            policy: AcceptancePolicy::from_megabytes(100),
            generation_timeout: Duration::from_secs(3600),
            chunk_bytes: 1000,
            prompt: DEFAULT_ANALYSIS_PROMPT.to_string(),
        }
    }
}

/// Where the analysis for a resolved repository comes from.
#[derive(Debug)]
pub enum Acquisition {
    Cached(ArtifactRef),
    Fresh(WorkingDirectory),
}

/// Metadata plus either a cached artifact or a fresh working copy.
#[derive(Debug)]
pub struct ResolvedRepository {
    pub metadata: RepositoryMetadata,
    pub key: CacheKey,
    pub acquisition: Acquisition,
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownOutcome {
    pub key: CacheKey,
    pub cache_hit: bool,
    pub chunks: u64,
    pub bytes: u64,
}

pub struct TeardownPipeline {
    metadata: Arc<dyn MetadataSource>,
    acquirer: Arc<dyn RepositoryAcquirer>,
    generator: Arc<dyn Generator>,
    storage: Arc<dyn StorageAdaptor>,
    config: PipelineConfig,
}

impl TeardownPipeline {
    pub fn new(
        metadata: Arc<dyn MetadataSource>,
        acquirer: Arc<dyn RepositoryAcquirer>,
        generator: Arc<dyn Generator>,
        storage: Arc<dyn StorageAdaptor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            metadata,
            acquirer,
            generator,
            storage,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline for `reference`, emitting the artifact on `emitter`
    /// and terminating the stream with exactly one `end`.
    ///
    /// Cancelling `cancel` aborts the run; the working directory is removed
    /// and the stream ends with `cancelled`.
    pub async fn run(
        &self,
        reference: &str,
        query: Option<&str>,
        mut emitter: StreamEmitter,
        cancel: CancellationToken,
    ) -> Result<TeardownOutcome, PipelineError> {
        let stream_id = emitter.stream_id();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            result = self.execute(reference, query, &mut emitter) => result,
        };

        match result {
            Ok(outcome) => {
                tracing::info!(
                    "Stream {} delivered {} ({} chunks, {} bytes, cache_hit={})",
                    stream_id,
                    outcome.key,
                    outcome.chunks,
                    outcome.bytes,
                    outcome.cache_hit
                );
                emitter.finish().await?;
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!("Stream {} teardown of {} failed: {}", stream_id, reference, e);
                if let Err(emit) = emitter.fail(e.to_details()).await {
                    tracing::debug!("Could not report failure on stream {}: {}", stream_id, emit);
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        reference: &str,
        query: Option<&str>,
        emitter: &mut StreamEmitter,
    ) -> Result<TeardownOutcome, PipelineError> {
        let resolved = self.resolve(reference).await?;
        let key = resolved.key.clone();

        match resolved.acquisition {
            Acquisition::Cached(artifact) => {
                tracing::info!("Cache hit for {}", key);
                let (chunks, bytes) = self.replay(&artifact, emitter).await?;
                Ok(TeardownOutcome {
                    key,
                    cache_hit: true,
                    chunks,
                    bytes,
                })
            }
            Acquisition::Fresh(workdir) => {
                let result = self.generate_and_replay(&workdir, &key, query, emitter).await;
                workdir.release().await;
                let (chunks, bytes) = result?;
                Ok(TeardownOutcome {
                    key,
                    cache_hit: false,
                    chunks,
                    bytes,
                })
            }
        }
    }

    /// Steps up to acquisition: parse, fetch metadata, apply policy, look up
    /// the cache, and clone on a miss.
    pub async fn resolve(&self, reference: &str) -> Result<ResolvedRepository, PipelineError> {
        let repo = RepoReference::parse(reference)?;
        let metadata = self.metadata.get_metadata(&repo.owner, &repo.name).await?;
        self.config.policy.check(&metadata)?;

        let key = CacheKey::new(&metadata.full_name, &metadata.latest_commit.sha);
        let cached = match self.storage.find(&key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Cache lookup for {} failed, treating as miss: {}", key, e);
                None
            }
        };

        let acquisition = match cached {
            Some(artifact) => Acquisition::Cached(artifact),
            None => {
                tracing::info!("Cache miss for {}; acquiring", key);
                Acquisition::Fresh(self.acquirer.acquire(&metadata, true).await?)
            }
        };

        Ok(ResolvedRepository {
            metadata,
            key,
            acquisition,
        })
    }

    async fn generate_and_replay(
        &self,
        workdir: &WorkingDirectory,
        key: &CacheKey,
        query: Option<&str>,
        emitter: &mut StreamEmitter,
    ) -> Result<(u64, u64), PipelineError> {
        let local = self.generate(workdir, query).await?;
        tracing::info!("Generated analysis for {}", key);

        let Some(artifact) = self.persist(&local, key).await else {
            return self.replay_file(&local, emitter).await;
        };
        match self.replay(&artifact, emitter).await {
            Err(PipelineError::Storage(e)) => {
                tracing::warn!("Stored artifact for {} unreadable, using local copy: {}", key, e);
                self.replay_file(&local, emitter).await
            }
            other => other,
        }
    }

    /// Persist the artifact. Failures are logged and only mean the next
    /// request misses the cache.
    async fn persist(&self, local: &std::path::Path, key: &CacheKey) -> Option<ArtifactRef> {
        if let Err(e) = self.storage.create_namespace(&key.prefix()).await {
            tracing::warn!("persist_failed: namespace for {}: {}", key, e);
            return None;
        }
        match self.storage.persist(local, key).await {
            Ok(artifact) => {
                tracing::info!("Persisted {} to {}", key, artifact);
                Some(artifact)
            }
            Err(e) => {
                tracing::warn!("persist_failed: {}: {}", key, e);
                None
            }
        }
    }

    fn prompt(&self, query: Option<&str>) -> String {
        match query.map(str::trim).filter(|q| !q.is_empty()) {
            Some(query) => format!("{}\n\nPay particular attention to: {}", self.config.prompt, query),
            None => self.config.prompt.clone(),
        }
    }

    /// Run the generation step and return the path of the produced artifact.
    ///
    /// `generation_timeout` bounds the whole step: starting the run, draining
    /// its output and waiting for it to exit.
    async fn generate(
        &self,
        workdir: &WorkingDirectory,
        query: Option<&str>,
    ) -> Result<PathBuf, PipelineError> {
        let limit = self.config.generation_timeout;
        let deadline = tokio::time::Instant::now() + limit;
        let prompt = self.prompt(query);

        let start = self.generator.start(workdir.path(), &prompt);
        let mut run = tokio::time::timeout_at(deadline, start)
            .await
            .map_err(|_| PipelineError::GenerationTimeout(limit))??;
        let mut transcript = String::new();

        let consumed = tokio::time::timeout_at(deadline, async {
            while let Some(chunk) = run.next_chunk().await {
                match chunk {
                    Ok(GenerationChunk::Finished { is_error: true, .. }) => {
                        return Err(GenerationError::ProcessFailed(
                            "generation reported an error result".to_string(),
                        ));
                    }
                    Ok(chunk) => {
                        if let GenerationChunk::ToolUse { name, .. } = &chunk {
                            tracing::debug!("Generation used tool {}", name);
                        }
                        if let Some(text) = chunk.display_text() {
                            transcript.push_str(&text);
                        }
                    }
                    Err(e) => tracing::warn!("Skipping unreadable generation output: {}", e),
                }
            }
            Ok(())
        })
        .await;

        match consumed {
            Err(_) => {
                if let Err(e) = run.kill().await {
                    tracing::warn!("Failed to kill timed out generation: {}", e);
                }
                return Err(PipelineError::GenerationTimeout(limit));
            }
            Ok(Err(e)) => {
                let _ = run.kill().await;
                return Err(e.into());
            }
            Ok(Ok(())) => {}
        }

        // Dropping a run that has not exited kills it.
        let outcome = tokio::time::timeout_at(deadline, run.wait())
            .await
            .map_err(|_| PipelineError::GenerationTimeout(limit))??;
        if !outcome.success {
            return Err(GenerationError::ProcessFailed(format!(
                "exit code {:?}",
                outcome.exit_code
            ))
            .into());
        }

        let artifact = workdir.path().join(ARTIFACT_FILE);
        if !tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
            tracing::debug!("No {} written; using generation transcript", ARTIFACT_FILE);
            tokio::fs::write(&artifact, transcript.as_bytes())
                .await
                .map_err(|source| PipelineError::Artifact {
                    path: artifact.clone(),
                    source,
                })?;
        }
        Ok(artifact)
    }

    async fn replay(
        &self,
        artifact: &ArtifactRef,
        emitter: &mut StreamEmitter,
    ) -> Result<(u64, u64), PipelineError> {
        let stream = self.storage.open_for_read(artifact).await?;
        emit_chunks(stream, self.config.chunk_bytes, emitter).await
    }

    async fn replay_file(
        &self,
        path: &std::path::Path,
        emitter: &mut StreamEmitter,
    ) -> Result<(u64, u64), PipelineError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| PipelineError::Artifact {
                path: path.to_path_buf(),
                source,
            })?;
        emit_chunks(ReaderStream::new(file).boxed(), self.config.chunk_bytes, emitter).await
    }
}

/// Emit an artifact as text deltas of at most `chunk_bytes` bytes each.
async fn emit_chunks(
    mut stream: ArtifactStream,
    chunk_bytes: usize,
    emitter: &mut StreamEmitter,
) -> Result<(u64, u64), PipelineError> {
    let mut splitter = ChunkSplitter::new(chunk_bytes);
    let mut chunks = 0;
    let mut bytes = 0;

    while let Some(read) = stream.next().await {
        let read = read.map_err(PipelineError::Read)?;
        for piece in splitter.push(&read) {
            bytes += piece.len() as u64;
            emitter.delta(piece).await?;
            chunks += 1;
        }
    }
    if let Some(piece) = splitter.finish() {
        bytes += piece.len() as u64;
        emitter.delta(piece).await?;
        chunks += 1;
    }

    Ok((chunks, bytes))
}

/// Splits a byte stream into text pieces of at most `max` bytes without
/// cutting through a UTF-8 sequence.
#[derive(Debug)]
pub struct ChunkSplitter {
    max: usize,
    pending: Vec<u8>,
}

impl ChunkSplitter {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(4),
            pending: Vec::new(),
        }
    }

    /// Feed bytes and take every piece that is full.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut pieces = Vec::new();
        while self.pending.len() >= self.max {
            let cut = self.boundary();
            let piece: Vec<u8> = self.pending.drain(..cut).collect();
            pieces.push(String::from_utf8_lossy(&piece).into_owned());
        }
        pieces
    }

    /// Take whatever is left.
    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }

    /// Longest prefix of the first `max` bytes that does not end inside a
    /// UTF-8 sequence. An incomplete trailing sequence stays pending until the
    /// next push completes it; bytes that can never decode are cut on their own.
    fn boundary(&self) -> usize {
        let window = &self.pending[..self.max];
        match std::str::from_utf8(window) {
            Ok(_) => self.max,
            Err(e) if e.valid_up_to() > 0 => e.valid_up_to(),
            Err(e) => e.error_len().unwrap_or(self.max),
        }
    }
}
