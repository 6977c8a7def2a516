//! JSONL event parsing for generation output.
//!
//! The Claude CLI outputs JSONL when run with `--print --output-format stream-json`.
//! Each line becomes zero or more [`GenerationChunk`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A structured increment produced by a generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationChunk {
    /// Text produced by the model.
    Text { text: String },

    /// The model invoked a tool.
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        input: Value,
    },

    /// End-of-run marker.
    Finished {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        usage: Option<UsageStats>,
    },
}

impl GenerationChunk {
    /// Parse a JSONL line into chunks (Claude format).
    pub fn parse_claude(line: &str) -> Result<Vec<Self>, serde_json::Error> {
        let parsed: ClaudeStreamEvent = serde_json::from_str(line)?;
        Ok(parsed.into_chunks())
    }

    /// Check if this chunk is the end-of-run marker.
    pub fn is_finished(&self) -> bool {
        matches!(self, GenerationChunk::Finished { .. })
    }

    /// Render the chunk as display text: text verbatim, tool input as a
    /// fenced JSON block.
    pub fn display_text(&self) -> Option<String> {
        match self {
            GenerationChunk::Text { text } => Some(text.clone()),
            GenerationChunk::ToolUse { input, .. } => Some(format_tool_input(input)),
            GenerationChunk::Finished { .. } => None,
        }
    }
}

/// Format a tool invocation's input as a fenced JSON block.
pub fn format_tool_input(input: &Value) -> String {
    format!("\n```json\n{}\n```\n", input)
}

/// Token usage statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub cached_input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeStreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: ClaudeMessage },
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        is_error: Option<bool>,
        #[serde(default)]
        usage: Option<ClaudeUsage>,
    },
    #[serde(other)]
    Unknown,
}

impl ClaudeStreamEvent {
    fn into_chunks(self) -> Vec<GenerationChunk> {
        match self {
            ClaudeStreamEvent::Assistant { message } => message.into_chunks(),
            ClaudeStreamEvent::Result { is_error, usage } => vec![GenerationChunk::Finished {
                is_error: is_error.unwrap_or(false),
                usage: usage.map(|u| UsageStats {
                    input_tokens: u.input_tokens,
                    cached_input_tokens: u.cache_read_input_tokens,
                    output_tokens: u.output_tokens,
                }),
            }],
            ClaudeStreamEvent::Unknown => Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClaudeMessage {
    content: Vec<ClaudeContent>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

impl ClaudeMessage {
    fn into_chunks(self) -> Vec<GenerationChunk> {
        let mut chunks = Vec::new();

        for block in self.content {
            match block.kind.as_str() {
                "text" => {
                    if let Some(text) = block.text.filter(|t| !t.is_empty()) {
                        chunks.push(GenerationChunk::Text { text });
                    }
                }
                "tool_use" => chunks.push(GenerationChunk::ToolUse {
                    id: block.id,
                    name: block.name.unwrap_or_default(),
                    input: block.input.unwrap_or(Value::Null),
                }),
                _ => {}
            }
        }

        chunks
    }
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}
