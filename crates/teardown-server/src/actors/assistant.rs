use super::{parse_payload, require_history, stream_chat, Actor, PreparedInput, ValidationError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use teardown_core::chat::{ChatBackend, Message};
use teardown_core::envelope::ActorKind;
use teardown_core::stream::StreamEmitter;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryRequest {
    pub history: Vec<Message>,
}

/// Plain conversational assistant: the history goes to the model as is.
pub struct AssistantActor {
    chat: Arc<dyn ChatBackend>,
    model: String,
}

impl AssistantActor {
    pub fn new(chat: Arc<dyn ChatBackend>, model: String) -> Self {
        Self { chat, model }
    }
}

#[async_trait]
impl Actor for AssistantActor {
    fn kind(&self) -> ActorKind {
        ActorKind::Assistant
    }

    fn validate_and_prepare(&self, data: &Value) -> Result<PreparedInput, ValidationError> {
        let request: HistoryRequest = parse_payload(data)?;
        require_history(&request.history)?;
        Ok(PreparedInput::Chat {
            model: self.model.clone(),
            messages: request.history,
        })
    }

    async fn produce(
        &self,
        input: PreparedInput,
        emitter: StreamEmitter,
        cancel: CancellationToken,
    ) {
        let PreparedInput::Chat { model, messages } = input else {
            tracing::error!("Assistant received a non-chat input");
            return;
        };
        stream_chat(self.chat.as_ref(), &model, &messages, emitter, cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::testing::ScriptedChat;
    use serde_json::json;
    use teardown_core::chat::Role;

    fn actor() -> AssistantActor {
        AssistantActor::new(Arc::new(ScriptedChat::replying(&["ok"])), "gpt-4o".into())
    }

    #[test]
    fn test_history_is_forwarded_unchanged() {
        let input = actor()
            .validate_and_prepare(&json!({
                "history": [
                    {"role": "human", "content": "hi"},
                    {"role": "generative", "content": "hello"},
                    {"role": "user", "content": "again"}
                ]
            }))
            .unwrap();
        let PreparedInput::Chat { model, messages } = input else {
            panic!("expected chat input");
        };
        assert_eq!(model, "gpt-4o");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, Role::Generative);
    }

    #[test]
    fn test_empty_or_missing_history_is_invalid() {
        assert!(matches!(
            actor().validate_and_prepare(&json!({"history": []})),
            Err(ValidationError::EmptyHistory)
        ));
        assert!(matches!(
            actor().validate_and_prepare(&json!({})),
            Err(ValidationError::Payload(_))
        ));
        assert!(actor()
            .validate_and_prepare(&json!({"history": [{"role": "robot", "content": "x"}]}))
            .is_err());
    }
}
