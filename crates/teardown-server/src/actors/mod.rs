//! Actors bind one request payload shape to a chunk-producing procedure.
//!
//! The dispatcher picks an actor by the envelope's actor tag, asks it to
//! validate the payload, then schedules its procedure on a fresh stream.

mod assistant;
mod claude;
mod coder;
mod writer;

pub use assistant::AssistantActor;
pub use claude::ClaudeActor;
pub use coder::CoderActor;
pub use writer::WriterActor;

use crate::state::{Connection, StateError};
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use teardown_core::chat::{ChatBackend, ChatDelta, Message};
use teardown_core::config::ModelConfig;
use teardown_core::envelope::{ActorKind, ErrorCode, ErrorDetails};
use teardown_core::pipeline::TeardownPipeline;
use teardown_core::sequencing::StreamId;
use teardown_core::stream::StreamEmitter;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("History must contain at least one message")]
    EmptyHistory,

    #[error("Field {0} must not be blank")]
    Blank(&'static str),
}

/// Input an actor has validated and is ready to run.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedInput {
    Chat {
        model: String,
        messages: Vec<Message>,
    },
    Teardown {
        repo_url: String,
        query: Option<String>,
    },
}

#[async_trait]
pub trait Actor: Send + Sync {
    fn kind(&self) -> ActorKind;

    /// Parse the raw payload into this actor's input and apply request-level
    /// checks. Must not have side effects.
    fn validate_and_prepare(&self, data: &Value) -> Result<PreparedInput, ValidationError>;

    /// Produce the stream's chunks and its single terminal `end`.
    async fn produce(
        &self,
        input: PreparedInput,
        emitter: StreamEmitter,
        cancel: CancellationToken,
    );
}

/// Mint a stream for `request_id` on `connection`, schedule the actor's
/// procedure on it and return the new stream id without waiting.
pub async fn begin_stream(
    actor: Arc<dyn Actor>,
    connection: &Connection,
    request_id: &str,
    input: PreparedInput,
) -> Result<StreamId, StateError> {
    let (emitter, cancel) = connection.open_stream(actor.kind(), request_id).await?;
    let stream_id = emitter.stream_id();
    let connection = connection.clone();

    tokio::spawn(async move {
        let produced = tokio::spawn(async move { actor.produce(input, emitter, cancel).await });
        if let Err(e) = produced.await {
            tracing::error!("Stream {} task failed: {}", stream_id, e);
        }
        connection.finish_stream(stream_id).await;
    });

    Ok(stream_id)
}

/// Actor implementations keyed by their tag.
#[derive(Clone, Default)]
pub struct ActorRegistry {
    actors: HashMap<ActorKind, Arc<dyn Actor>>,
}

impl ActorRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The four standard actors.
    pub fn standard(
        chat: Arc<dyn ChatBackend>,
        models: &ModelConfig,
        pipeline: Arc<TeardownPipeline>,
    ) -> Self {
        Self::empty()
            .with(AssistantActor::new(chat.clone(), models.assistant.clone()))
            .with(CoderActor::new(chat.clone(), models.coder.clone()))
            .with(WriterActor::new(chat, models.writer.clone()))
            .with(ClaudeActor::new(pipeline))
    }

    pub fn with(mut self, actor: impl Actor + 'static) -> Self {
        self.actors.insert(actor.kind(), Arc::new(actor));
        self
    }

    pub fn get(&self, kind: ActorKind) -> Option<Arc<dyn Actor>> {
        self.actors.get(&kind).cloned()
    }
}

pub(crate) fn parse_payload<T: DeserializeOwned>(data: &Value) -> Result<T, ValidationError> {
    Ok(serde_json::from_value(data.clone())?)
}

pub(crate) fn require_history(history: &[Message]) -> Result<(), ValidationError> {
    if history.is_empty() {
        return Err(ValidationError::EmptyHistory);
    }
    Ok(())
}

/// Relay a chat completion onto a stream and terminate it.
pub(crate) async fn stream_chat(
    backend: &dyn ChatBackend,
    model: &str,
    messages: &[Message],
    mut emitter: StreamEmitter,
    cancel: CancellationToken,
) {
    let stream_id = emitter.stream_id();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ErrorDetails::new(ErrorCode::Cancelled, "Stream cancelled")),
        result = relay_chat(backend, model, messages, &mut emitter) => result,
    };

    let ended = match result {
        Ok(()) => emitter.finish().await,
        Err(error) => {
            tracing::warn!("Stream {} failed: {}", stream_id, error.message);
            emitter.fail(error).await
        }
    };
    if let Err(e) = ended {
        tracing::debug!("Could not end stream {}: {}", stream_id, e);
    }
}

async fn relay_chat(
    backend: &dyn ChatBackend,
    model: &str,
    messages: &[Message],
    emitter: &mut StreamEmitter,
) -> Result<(), ErrorDetails> {
    let generation_failed = |e: &dyn std::fmt::Display| {
        ErrorDetails::new(ErrorCode::GenerationFailed, e.to_string())
    };

    let mut deltas = backend
        .stream(model, messages)
        .await
        .map_err(|e| generation_failed(&e))?;

    let mut finish_reason = None;
    while let Some(delta) = deltas.next().await {
        match delta.map_err(|e| generation_failed(&e))? {
            ChatDelta::Content(text) => {
                emitter
                    .delta(text)
                    .await
                    .map_err(|e| ErrorDetails::new(ErrorCode::InternalError, e.to_string()))?;
            }
            ChatDelta::Finished(reason) => finish_reason = Some(reason),
        }
    }

    match finish_reason {
        Some(reason) => {
            tracing::debug!("Stream {} finished: {}", emitter.stream_id(), reason);
            Ok(())
        }
        None => Err(ErrorDetails::new(
            ErrorCode::GenerationFailed,
            "Chat backend ended without a finish reason",
        )),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Mutex;
    use teardown_core::chat::{ChatBackend, ChatDelta, ChatError, ChatStream, Message};

    /// Chat backend that replays a fixed script and records each request.
    pub struct ScriptedChat {
        pub script: Vec<ChatDelta>,
        pub requests: Mutex<Vec<(String, Vec<Message>)>>,
    }

    impl ScriptedChat {
        pub fn new(script: Vec<ChatDelta>) -> Self {
            Self {
                script,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn replying(parts: &[&str]) -> Self {
            let mut script: Vec<ChatDelta> = parts
                .iter()
                .map(|p| ChatDelta::Content(p.to_string()))
                .collect();
            script.push(ChatDelta::Finished("stop".to_string()));
            Self::new(script)
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedChat {
        async fn stream(&self, model: &str, messages: &[Message]) -> Result<ChatStream, ChatError> {
            self.requests
                .lock()
                .unwrap()
                .push((model.to_string(), messages.to_vec()));
            let items: Vec<Result<ChatDelta, ChatError>> =
                self.script.iter().cloned().map(Ok).collect();
            Ok(futures::stream::iter(items).boxed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedChat;
    use super::*;
    use crate::state::AppState;
    use teardown_core::envelope::{Envelope, Modifier, ServerFrame};
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Some(envelope) = frame.envelope() {
                out.push(envelope.clone());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_stream_chat_relays_deltas() {
        let backend = ScriptedChat::replying(&["Hel", "lo"]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = StreamEmitter::new(tx, ActorKind::Assistant, "r1".into(), StreamId::new());
        stream_chat(
            &backend,
            "gpt-4o",
            &[Message::user("hi")],
            emitter,
            CancellationToken::new(),
        )
        .await;

        let envelopes = drain(&mut rx);
        assert_eq!(envelopes.len(), 3);
        assert_eq!(envelopes[0].data["delta"], "Hel");
        assert_eq!(envelopes[1].seq, Some(2));
        assert_eq!(envelopes[2].modifier, Modifier::End);
        assert_eq!(envelopes[2].data["finishReason"], "stop");
    }

    #[tokio::test]
    async fn test_stream_without_finish_reason_is_an_error() {
        let backend = ScriptedChat::new(vec![ChatDelta::Content("partial".into())]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = StreamEmitter::new(tx, ActorKind::Writer, "r1".into(), StreamId::new());
        stream_chat(&backend, "gpt-4o", &[], emitter, CancellationToken::new()).await;

        let envelopes = drain(&mut rx);
        let end = envelopes.last().unwrap();
        assert_eq!(end.data["finishReason"], "error");
        assert_eq!(end.error.as_ref().unwrap().code, ErrorCode::GenerationFailed);
    }

    #[tokio::test]
    async fn test_cancelled_chat_ends_with_cancelled() {
        let backend = ScriptedChat::replying(&["never"]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = StreamEmitter::new(tx, ActorKind::Writer, "r1".into(), StreamId::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        stream_chat(&backend, "gpt-4o", &[], emitter, cancel).await;

        let envelopes = drain(&mut rx);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(
            envelopes[0].error.as_ref().unwrap().code,
            ErrorCode::Cancelled
        );
    }

    struct PanickingActor;

    #[async_trait]
    impl Actor for PanickingActor {
        fn kind(&self) -> ActorKind {
            ActorKind::Writer
        }

        fn validate_and_prepare(&self, _data: &Value) -> Result<PreparedInput, ValidationError> {
            Ok(PreparedInput::Chat {
                model: "gpt-4o".into(),
                messages: Vec::new(),
            })
        }

        async fn produce(
            &self,
            _input: PreparedInput,
            _emitter: StreamEmitter,
            _cancel: CancellationToken,
        ) {
            panic!("actor blew up");
        }
    }

    #[tokio::test]
    async fn test_panicking_actor_releases_its_request_id() {
        let state = AppState::new(ActorRegistry::empty());
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = state.register_connection(tx).await;
        let actor: Arc<dyn Actor> = Arc::new(PanickingActor);
        let input = actor.validate_and_prepare(&Value::Null).unwrap();

        begin_stream(actor.clone(), &connection, "r1", input.clone())
            .await
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while connection.live_streams().await > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("stream was never forgotten");

        assert!(begin_stream(actor, &connection, "r1", input).await.is_ok());
    }

    #[test]
    fn test_registry_lookup_by_kind() {
        let registry = ActorRegistry::empty()
            .with(AssistantActor::new(
                Arc::new(ScriptedChat::replying(&[])),
                "gpt-4o".into(),
            ));
        assert!(registry.get(ActorKind::Assistant).is_some());
        assert!(registry.get(ActorKind::Claude).is_none());
    }
}
