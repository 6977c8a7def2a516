//! Generation-backend abstractions and configuration.

use crate::claude_generator::ClaudeRun;
use crate::events::GenerationChunk;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while running a generation step.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Failed to spawn generation process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Failed to parse generation output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Generation process exited with error: {0}")]
    ProcessFailed(String),

    #[error("Generation ended without a finish marker")]
    NoFinish,
}

/// Result of a completed generation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Whether the run reported success.
    pub success: bool,
    /// Exit code if available.
    pub exit_code: Option<i32>,
}

/// A running generation step with streaming output.
///
/// The chunk sequence is lazy, finite and cannot be restarted.
#[async_trait]
pub trait GenerationRun: Send {
    /// Wait for the next chunk.
    async fn next_chunk(&mut self) -> Option<Result<GenerationChunk, GenerationError>>;
    /// Drain remaining output and wait for the run to complete.
    async fn wait(self: Box<Self>) -> Result<GenerationOutcome, GenerationError>;
    /// Kill the run.
    async fn kill(&mut self) -> Result<(), GenerationError>;
}

/// Starts generation runs against a working directory.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn start(
        &self,
        working_dir: &Path,
        prompt: &str,
    ) -> Result<Box<dyn GenerationRun>, GenerationError>;
}

/// Configuration for running the Claude CLI.
#[derive(Debug, Clone)]
pub struct ClaudeGeneratorConfig {
    /// Path to the claude binary.
    pub claude_path: String,
    /// Model to use (optional, uses claude default if not set).
    pub model: Option<String>,
    /// Additional flags to pass to claude.
    pub extra_args: Vec<String>,
}

impl Default for ClaudeGeneratorConfig {
    fn default() -> Self {
        Self {
            claude_path: "claude".to_string(),
            model: None,
            extra_args: Vec::new(),
        }
    }
}

/// Generator backed by the Claude CLI.
#[derive(Debug, Clone, Default)]
pub struct ClaudeGenerator {
    config: ClaudeGeneratorConfig,
}

impl ClaudeGenerator {
    pub fn new(config: ClaudeGeneratorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Generator for ClaudeGenerator {
    async fn start(
        &self,
        working_dir: &Path,
        prompt: &str,
    ) -> Result<Box<dyn GenerationRun>, GenerationError> {
        let run = ClaudeRun::spawn(&self.config, working_dir, prompt).await?;
        Ok(Box::new(run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claude_config_default() {
        let config = ClaudeGeneratorConfig::default();
        assert_eq!(config.claude_path, "claude");
        assert!(config.model.is_none());
        assert!(config.extra_args.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ClaudeGenerator::new(ClaudeGeneratorConfig {
            claude_path: "/nonexistent/teardown-claude".to_string(),
            ..Default::default()
        });
        let result = generator.start(dir.path(), "hello").await;
        assert!(matches!(result, Err(GenerationError::Spawn(_))));
    }
}
