//! Claude CLI generation run.
//!
//! Spawns the CLI in the working directory and streams its JSONL output as
//! [`GenerationChunk`]s.

use crate::events::GenerationChunk;
use crate::generator::{ClaudeGeneratorConfig, GenerationError, GenerationOutcome, GenerationRun};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// A running Claude process with streaming output.
pub struct ClaudeRun {
    child: Child,
    chunk_rx: mpsc::Receiver<Result<GenerationChunk, GenerationError>>,
    finished: Option<bool>,
}

impl ClaudeRun {
    pub async fn spawn(
        config: &ClaudeGeneratorConfig,
        working_dir: &Path,
        prompt: &str,
    ) -> Result<Self, GenerationError> {
        let mut cmd = Command::new(&config.claude_path);

        cmd.arg("--print")
            .arg("--verbose")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--dangerously-skip-permissions")
            .current_dir(working_dir);

        if let Some(model) = &config.model {
            cmd.arg("--model").arg(model);
        }

        for arg in &config.extra_args {
            cmd.arg(arg);
        }

        cmd.arg(prompt);

        cmd.stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let chunk_rx = Self::spawn_reader(stdout);

        tracing::debug!("Spawned claude in {}", working_dir.display());

        Ok(Self {
            child,
            chunk_rx,
            finished: None,
        })
    }

    /// Spawn a background task to read lines from stdout and parse chunks.
    fn spawn_reader(
        stdout: tokio::process::ChildStdout,
    ) -> mpsc::Receiver<Result<GenerationChunk, GenerationError>> {
        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }

                match GenerationChunk::parse_claude(&line) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            if tx.send(Ok(chunk)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        if tx.send(Err(err.into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }
}

#[async_trait]
impl GenerationRun for ClaudeRun {
    async fn next_chunk(&mut self) -> Option<Result<GenerationChunk, GenerationError>> {
        let result = self.chunk_rx.recv().await?;

        if let Ok(GenerationChunk::Finished { is_error, .. }) = &result {
            self.finished = Some(!is_error);
        }

        Some(result)
    }

    async fn wait(mut self: Box<Self>) -> Result<GenerationOutcome, GenerationError> {
        while let Some(result) = self.next_chunk().await {
            if let Err(e) = result {
                tracing::warn!("Error reading generation output: {}", e);
            }
        }

        let status = self.child.wait().await?;
        let reported = self.finished.ok_or(GenerationError::NoFinish)?;

        Ok(GenerationOutcome {
            success: reported && status.success(),
            exit_code: status.code(),
        })
    }

    async fn kill(&mut self) -> Result<(), GenerationError> {
        self.child.kill().await.map_err(GenerationError::from)
    }
}
