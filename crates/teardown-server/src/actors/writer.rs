use super::assistant::HistoryRequest;
use super::{parse_payload, require_history, stream_chat, Actor, PreparedInput, ValidationError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use teardown_core::chat::{ChatBackend, Message};
use teardown_core::envelope::ActorKind;
use teardown_core::stream::StreamEmitter;
use tokio_util::sync::CancellationToken;

pub const WRITER_SYSTEM_PROMPT: &str =
    "You are a writer. Whatever is given to you, you write a rap about getting over a tragedy,";

pub struct WriterActor {
    chat: Arc<dyn ChatBackend>,
    model: String,
}

impl WriterActor {
    pub fn new(chat: Arc<dyn ChatBackend>, model: String) -> Self {
        Self { chat, model }
    }
}

#[async_trait]
impl Actor for WriterActor {
    fn kind(&self) -> ActorKind {
        ActorKind::Writer
    }

    fn validate_and_prepare(&self, data: &Value) -> Result<PreparedInput, ValidationError> {
        let request: HistoryRequest = parse_payload(data)?;
        require_history(&request.history)?;

        let mut messages = Vec::with_capacity(request.history.len() + 1);
        messages.push(Message::system(WRITER_SYSTEM_PROMPT));
        messages.extend(request.history);
        Ok(PreparedInput::Chat {
            model: self.model.clone(),
            messages,
        })
    }

    async fn produce(
        &self,
        input: PreparedInput,
        emitter: StreamEmitter,
        cancel: CancellationToken,
    ) {
        let PreparedInput::Chat { model, messages } = input else {
            tracing::error!("Writer received a non-chat input");
            return;
        };
        stream_chat(self.chat.as_ref(), &model, &messages, emitter, cancel).await;
    }
}
