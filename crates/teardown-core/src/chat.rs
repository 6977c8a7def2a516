//! Conversation messages and the streaming chat-completion backend.
//!
//! The backend speaks the OpenAI-compatible `chat/completions` API with
//! `stream: true`, reading server-sent events line by line.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Chat backend is not configured: {0}")]
    NotConfigured(String),

    #[error("Chat request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Chat backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse chat event: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Speaker of a conversation message.
///
/// `human` and `generative` are accepted aliases used by some clients and are
/// mapped onto `user` / `assistant` when sent to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Human,
    Generative,
    System,
}

impl Role {
    pub fn backend_role(&self) -> &'static str {
        match self {
            Role::User | Role::Human => "user",
            Role::Assistant | Role::Generative => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    fn to_backend(&self) -> Value {
        json!({ "role": self.role.backend_role(), "content": self.content })
    }
}

/// One increment of a chat completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatDelta {
    Content(String),
    Finished(String),
}

pub type ChatStream = BoxStream<'static, Result<ChatDelta, ChatError>>;

/// A service that turns a conversation into a stream of deltas.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn stream(&self, model: &str, messages: &[Message]) -> Result<ChatStream, ChatError>;
}

/// Configuration for an OpenAI-compatible chat backend.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub api_base: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://api.openai.com/v1".to_string(),
        }
    }
}

pub struct OpenAiChatBackend {
    config: OpenAiConfig,
    http: reqwest::Client,
}

impl OpenAiChatBackend {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn request_body(model: &str, messages: &[Message]) -> Value {
        let mut body = json!({
            "model": model,
            "stream": true,
            "messages": messages.iter().map(Message::to_backend).collect::<Vec<_>>(),
        });
        if model.starts_with("gpt-5") {
            body["reasoning_effort"] = json!("high");
        } else {
            body["temperature"] = json!(0.7);
        }
        body
    }
}

#[async_trait]
impl ChatBackend for OpenAiChatBackend {
    async fn stream(&self, model: &str, messages: &[Message]) -> Result<ChatStream, ChatError> {
        let api_key = self
            .config
            .api_key
            .clone()
            .ok_or_else(|| ChatError::NotConfigured("OPENAI_API_KEY is not set".to_string()))?;
        let url = format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        );

        let response = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .json(&Self::request_body(model, messages))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes = response.bytes_stream();
        let stream = spawn_stream(move |tx| async move {
            let mut lines = LineBuffer::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(ChatError::from(e))).await;
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    match parse_sse_line(&line) {
                        Ok(Some(SseItem::Deltas(deltas))) => {
                            for delta in deltas {
                                if tx.send(Ok(delta)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(Some(SseItem::Done)) => return,
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(stream)
    }
}

/// Run a producer on a background task and expose its output as a stream.
fn spawn_stream<F, Fut>(producer: F) -> ChatStream
where
    F: FnOnce(mpsc::Sender<Result<ChatDelta, ChatError>>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(100);
    tokio::spawn(producer(tx));
    futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
}

/// Reassembles newline-terminated lines from arbitrarily split bytes.
///
/// Lines are decoded only once complete, so a character split across two
/// network reads survives intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseItem {
    Deltas(Vec<ChatDelta>),
    Done,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    delta: Option<CompletionDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionDelta {
    #[serde(default)]
    content: Option<String>,
}

fn parse_sse_line(line: &str) -> Result<Option<SseItem>, ChatError> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    if payload == "[DONE]" {
        return Ok(Some(SseItem::Done));
    }

    let chunk: CompletionChunk = serde_json::from_str(payload)?;
    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(content) = choice.delta.and_then(|d| d.content) {
            if !content.is_empty() {
                deltas.push(ChatDelta::Content(content));
            }
        }
        if let Some(reason) = choice.finish_reason {
            deltas.push(ChatDelta::Finished(reason));
        }
    }
    Ok(Some(SseItem::Deltas(deltas)))
}
