//! Turns client frames into acknowledgements and scheduled streams.
//!
//! Nothing here waits on generation: a start is decoded, validated by its
//! actor and scheduled, and the acknowledgement is returned straight away.

use crate::actors::{begin_stream, ActorRegistry};
use crate::state::{Connection, StateError};
use serde::Deserialize;
use serde_json::Value;
use teardown_core::envelope::{
    decode_start, parse_start_event, Acknowledgement, ErrorCode, CANCEL_EVENT,
};
use teardown_core::sequencing::StreamId;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    stream_id: StreamId,
}

/// Handle one client frame and reply on the connection when an ack was
/// requested.
pub async fn handle_frame(
    actors: &ActorRegistry,
    connection: &Connection,
    event: &str,
    ack_id: Option<u64>,
    data: Value,
) {
    let ack = if event == CANCEL_EVENT {
        on_cancel(connection, data).await
    } else if parse_start_event(event).is_some() {
        on_start(actors, connection, event, data).await
    } else {
        tracing::warn!("Connection {} sent unknown event '{}'", connection.id, event);
        Acknowledgement::fail(ErrorCode::InvalidEnvelope, format!("Unknown event '{}'", event))
    };
    connection.send_ack(ack_id, ack).await;
}

/// Accept or reject a `start`.
pub async fn on_start(
    actors: &ActorRegistry,
    connection: &Connection,
    event: &str,
    raw: Value,
) -> Acknowledgement {
    let envelope = match decode_start(event, raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!("Rejected start on {}: {}", connection.id, e);
            return Acknowledgement::fail(ErrorCode::InvalidEnvelope, e.to_string());
        }
    };
    let Some(request_id) = envelope.request_id.clone() else {
        return Acknowledgement::fail(
            ErrorCode::InvalidEnvelope,
            "The envelope is missing request_id",
        );
    };

    let Some(actor) = actors.get(envelope.actor) else {
        return Acknowledgement::fail(
            ErrorCode::InvalidEnvelope,
            format!("Actor '{}' is not available", envelope.actor),
        );
    };

    let input = match actor.validate_and_prepare(&envelope.data) {
        Ok(input) => input,
        Err(e) => {
            tracing::debug!("Rejected {} request {}: {}", envelope.actor, request_id, e);
            return Acknowledgement::fail(ErrorCode::InvalidData, e.to_string());
        }
    };

    match begin_stream(actor, connection, &request_id, input).await {
        Ok(stream_id) => Acknowledgement::ok(request_id, stream_id),
        Err(e @ StateError::DuplicateRequest(_)) => {
            Acknowledgement::fail(ErrorCode::InvalidEnvelope, e.to_string())
        }
        Err(e @ StateError::ConnectionClosed) => {
            Acknowledgement::fail(ErrorCode::InternalError, e.to_string())
        }
    }
}

/// Cancel a live stream on this connection.
pub async fn on_cancel(connection: &Connection, raw: Value) -> Acknowledgement {
    let request: CancelRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => {
            return Acknowledgement::fail(
                ErrorCode::InvalidData,
                format!("Invalid cancel request: {}", e),
            )
        }
    };

    match connection.cancel_stream(request.stream_id).await {
        Some(request_id) => Acknowledgement::ok(request_id, request.stream_id),
        None => Acknowledgement::fail(
            ErrorCode::InvalidData,
            format!("No live stream {}", request.stream_id),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::testing::ScriptedChat;
    use crate::actors::{AssistantActor, WriterActor};
    use crate::state::AppState;
    use serde_json::json;
    use std::sync::Arc;
    use teardown_core::envelope::{Envelope, Modifier, ServerFrame};
    use tokio::sync::mpsc;

    fn registry() -> ActorRegistry {
        let chat = Arc::new(ScriptedChat::replying(&["one ", "two"]));
        ActorRegistry::empty()
            .with(WriterActor::new(chat.clone(), "gpt-4o".into()))
            .with(AssistantActor::new(chat, "gpt-4o".into()))
    }

    fn writer_start(request_id: &str) -> Value {
        serde_json::to_value(Envelope::start(
            teardown_core::envelope::ActorKind::Writer,
            request_id,
            json!({"history": [{"role": "user", "content": "hi"}]}),
        ))
        .unwrap()
    }

    async fn connect() -> (AppState, Connection, mpsc::UnboundedReceiver<ServerFrame>) {
        let state = AppState::new(registry());
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = state.register_connection(tx).await;
        (state, connection, rx)
    }

    fn ack_fail_code(ack: Acknowledgement) -> ErrorCode {
        match ack {
            Acknowledgement::Fail { code, .. } => code,
            Acknowledgement::Ok { .. } => panic!("expected a failed ack"),
        }
    }

    #[tokio::test]
    async fn test_start_streams_after_ack() {
        let (state, connection, mut rx) = connect().await;
        handle_frame(
            state.actors(),
            &connection,
            "c2s.writer.stream.start",
            Some(1),
            writer_start("r1"),
        )
        .await;

        let Some(ServerFrame::Ack { ack: 1, data }) = rx.recv().await else {
            panic!("expected the ack first");
        };
        let stream_id = data.stream_id().unwrap();

        let mut seqs = Vec::new();
        loop {
            let frame = rx.recv().await.unwrap();
            let envelope = frame.envelope().unwrap();
            assert_eq!(envelope.stream_id, Some(stream_id));
            assert_eq!(envelope.request_id.as_deref(), Some("r1"));
            seqs.push(envelope.seq.unwrap());
            if envelope.modifier == Modifier::End {
                assert_eq!(envelope.data["finishReason"], "stop");
                break;
            }
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_request_id_is_invalid_envelope() {
        let (state, connection, _rx) = connect().await;
        let mut raw = writer_start("r1");
        raw.as_object_mut().unwrap().remove("requestId");
        let ack = on_start(state.actors(), &connection, "c2s.writer.stream.start", raw).await;
        assert_eq!(ack_fail_code(ack), ErrorCode::InvalidEnvelope);
        assert_eq!(connection.live_streams().await, 0);
    }

    #[tokio::test]
    async fn test_event_actor_mismatch_is_invalid_envelope() {
        let (state, connection, _rx) = connect().await;
        let ack = on_start(
            state.actors(),
            &connection,
            "c2s.assistant.stream.start",
            writer_start("r1"),
        )
        .await;
        assert_eq!(ack_fail_code(ack), ErrorCode::InvalidEnvelope);
    }

    #[tokio::test]
    async fn test_bad_payload_is_invalid_data_without_side_effects() {
        let (state, connection, mut rx) = connect().await;
        let raw = serde_json::to_value(Envelope::start(
            teardown_core::envelope::ActorKind::Writer,
            "r1",
            json!({"history": []}),
        ))
        .unwrap();
        let ack = on_start(state.actors(), &connection, "c2s.writer.stream.start", raw).await;
        assert_eq!(ack_fail_code(ack), ErrorCode::InvalidData);
        assert_eq!(connection.live_streams().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregistered_actor_is_rejected() {
        let (state, connection, _rx) = connect().await;
        let raw = serde_json::to_value(Envelope::start(
            teardown_core::envelope::ActorKind::Claude,
            "r1",
            json!({"repoUrl": "octo/widgets"}),
        ))
        .unwrap();
        let ack = on_start(state.actors(), &connection, "c2s.claude.stream.start", raw).await;
        assert_eq!(ack_fail_code(ack), ErrorCode::InvalidEnvelope);
    }

    #[tokio::test]
    async fn test_unknown_event_and_cancel_of_unknown_stream() {
        let (state, connection, mut rx) = connect().await;
        handle_frame(state.actors(), &connection, "c2s.nope", Some(4), json!({})).await;
        let Some(ServerFrame::Ack { ack: 4, data }) = rx.recv().await else {
            panic!("expected an ack");
        };
        assert!(!data.is_ok());

        let ack = on_cancel(&connection, json!({"streamId": StreamId::new()})).await;
        assert_eq!(ack_fail_code(ack), ErrorCode::InvalidData);
        let ack = on_cancel(&connection, json!({"streamId": "not-a-uuid"})).await;
        assert_eq!(ack_fail_code(ack), ErrorCode::InvalidData);
    }

    #[tokio::test]
    async fn test_no_ack_requested_still_streams() {
        let (state, connection, mut rx) = connect().await;
        handle_frame(
            state.actors(),
            &connection,
            "c2s.writer.stream.start",
            None,
            writer_start("r2"),
        )
        .await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.envelope().unwrap().seq, Some(1));
    }
}
