//! Wire envelope shared by every streamed operation.
//!
//! Clients send `start` envelopes; the server answers with an
//! [`Acknowledgement`] and then a sequence of `chunk` envelopes closed by a
//! single `end`. All keys are camelCase on the wire.

use crate::sequencing::StreamId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Current protocol version stamped on every envelope.
pub const PROTOCOL_VERSION: &str = "1";

/// Client event used to cancel a live stream.
pub const CANCEL_EVENT: &str = "c2s.stream.cancel";

/// Errors produced while decoding an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("The envelope is not in the correct format: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("The envelope is missing request_id")]
    MissingRequestId,

    #[error("Event '{event}' does not match envelope actor '{actor}'")]
    ActorMismatch { event: String, actor: ActorKind },

    #[error("Unknown event '{0}'")]
    UnknownEvent(String),

    #[error("Expected a client-to-server start envelope")]
    NotAStart,
}

/// Which side emitted an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "c2s")]
    ClientToServer,
    #[serde(rename = "s2c")]
    ServerToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "c2s",
            Direction::ServerToClient => "s2c",
        }
    }
}

/// The closed set of actors a stream can be addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Assistant,
    Coder,
    Writer,
    /// Repository analysis.
    Claude,
}

impl ActorKind {
    pub const ALL: [ActorKind; 4] = [
        ActorKind::Assistant,
        ActorKind::Coder,
        ActorKind::Writer,
        ActorKind::Claude,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::Assistant => "assistant",
            ActorKind::Coder => "coder",
            ActorKind::Writer => "writer",
            ActorKind::Claude => "claude",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Name of the client event that starts a stream for this actor.
    pub fn start_event(&self) -> String {
        format!("c2s.{}.stream.start", self.as_str())
    }
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Stream,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    Start,
    Chunk,
    End,
}

impl Modifier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modifier::Start => "start",
            Modifier::Chunk => "chunk",
            Modifier::End => "end",
        }
    }
}

/// Error codes surfaced to clients, either in a failed ack or a terminal `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidEnvelope,
    InvalidData,
    InvalidReference,
    NotAccessible,
    TooLarge,
    Disabled,
    AcquisitionFailed,
    GenerationFailed,
    GenerationTimeout,
    PersistFailed,
    Cancelled,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidEnvelope => "invalid_envelope",
            ErrorCode::InvalidData => "invalid_data",
            ErrorCode::InvalidReference => "invalid_reference",
            ErrorCode::NotAccessible => "not_accessible",
            ErrorCode::TooLarge => "too_large",
            ErrorCode::Disabled => "disabled",
            ErrorCode::AcquisitionFailed => "acquisition_failed",
            ErrorCode::GenerationFailed => "generation_failed",
            ErrorCode::GenerationTimeout => "generation_timeout",
            ErrorCode::PersistFailed => "persist_failed",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error attached to an envelope that terminates a stream abnormally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Reason carried by the terminal `end` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Error,
}

/// The unit of wire communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub v: String,
    #[serde(default = "new_message_id")]
    pub id: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default = "now_millis")]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub direction: Direction,
    pub actor: ActorKind,
    pub action: Action,
    pub modifier: Modifier,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Envelope {
    /// Build a client `start` envelope.
    pub fn start(actor: ActorKind, request_id: impl Into<String>, data: Value) -> Self {
        Self {
            v: default_version(),
            id: new_message_id(),
            ts: now_millis(),
            request_id: Some(request_id.into()),
            stream_id: None,
            seq: None,
            direction: Direction::ClientToServer,
            actor,
            action: Action::Stream,
            modifier: Modifier::Start,
            data,
            error: None,
        }
    }

    /// Build a server envelope belonging to an accepted stream.
    pub fn server(
        actor: ActorKind,
        modifier: Modifier,
        request_id: &str,
        stream_id: StreamId,
        seq: u64,
        data: Value,
    ) -> Self {
        Self {
            v: default_version(),
            id: new_message_id(),
            ts: now_millis(),
            request_id: Some(request_id.to_string()),
            stream_id: Some(stream_id),
            seq: Some(seq),
            direction: Direction::ServerToClient,
            actor,
            action: Action::Stream,
            modifier,
            data,
            error: None,
        }
    }

    /// Transport event name, e.g. `s2c.writer.stream.chunk`.
    pub fn event_name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.direction.as_str(),
            self.actor.as_str(),
            self.action.as_str(),
            self.modifier.as_str()
        )
    }
}

/// Serialize an envelope to its JSON text form.
pub fn encode(envelope: &Envelope) -> Result<String, EnvelopeError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parse an envelope from JSON text.
pub fn decode(raw: &str) -> Result<Envelope, EnvelopeError> {
    let envelope: Envelope = serde_json::from_str(raw)?;
    check_structure(envelope)
}

/// Parse an envelope from an already-deserialized JSON value.
pub fn decode_value(raw: Value) -> Result<Envelope, EnvelopeError> {
    let envelope: Envelope = serde_json::from_value(raw)?;
    check_structure(envelope)
}

fn check_structure(envelope: Envelope) -> Result<Envelope, EnvelopeError> {
    if envelope.modifier == Modifier::Start
        && envelope
            .request_id
            .as_deref()
            .map(str::trim)
            .map_or(true, str::is_empty)
    {
        return Err(EnvelopeError::MissingRequestId);
    }
    Ok(envelope)
}

/// Decode a client start envelope received under `event`, checking that the
/// event name agrees with the envelope itself.
pub fn decode_start(event: &str, raw: Value) -> Result<Envelope, EnvelopeError> {
    let declared = parse_start_event(event)
        .ok_or_else(|| EnvelopeError::UnknownEvent(event.to_string()))?;
    let envelope = decode_value(raw)?;
    if envelope.direction != Direction::ClientToServer || envelope.modifier != Modifier::Start {
        return Err(EnvelopeError::NotAStart);
    }
    if envelope.actor != declared {
        return Err(EnvelopeError::ActorMismatch {
            event: event.to_string(),
            actor: envelope.actor,
        });
    }
    Ok(envelope)
}

/// Resolve the actor named by a `c2s.<actor>.stream.start` event.
pub fn parse_start_event(event: &str) -> Option<ActorKind> {
    let mut parts = event.split('.');
    match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some("c2s"), Some(actor), Some("stream"), Some("start"), None) => ActorKind::parse(actor),
        _ => None,
    }
}

/// Synchronous reply to a `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "AckWire", try_from = "AckWire")]
pub enum Acknowledgement {
    Ok {
        request_id: String,
        stream_id: StreamId,
    },
    Fail {
        code: ErrorCode,
        message: String,
    },
}

impl Acknowledgement {
    pub fn ok(request_id: impl Into<String>, stream_id: StreamId) -> Self {
        Acknowledgement::Ok {
            request_id: request_id.into(),
            stream_id,
        }
    }

    pub fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
        Acknowledgement::Fail {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Acknowledgement::Ok { .. })
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Acknowledgement::Ok { stream_id, .. } => Some(*stream_id),
            Acknowledgement::Fail { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckWire {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream_id: Option<StreamId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<AckError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AckError {
    code: ErrorCode,
    message: String,
}

impl From<Acknowledgement> for AckWire {
    fn from(ack: Acknowledgement) -> Self {
        match ack {
            Acknowledgement::Ok {
                request_id,
                stream_id,
            } => AckWire {
                ok: true,
                request_id: Some(request_id),
                stream_id: Some(stream_id),
                error: None,
            },
            Acknowledgement::Fail { code, message } => AckWire {
                ok: false,
                request_id: None,
                stream_id: None,
                error: Some(AckError { code, message }),
            },
        }
    }
}

impl TryFrom<AckWire> for Acknowledgement {
    type Error = String;

    fn try_from(wire: AckWire) -> Result<Self, Self::Error> {
        if wire.ok {
            match (wire.request_id, wire.stream_id) {
                (Some(request_id), Some(stream_id)) => Ok(Acknowledgement::Ok {
                    request_id,
                    stream_id,
                }),
                _ => Err("ok acknowledgement requires requestId and streamId".to_string()),
            }
        } else {
            let error = wire
                .error
                .ok_or_else(|| "failed acknowledgement requires error".to_string())?;
            Ok(Acknowledgement::Fail {
                code: error.code,
                message: error.message,
            })
        }
    }
}

/// Frame sent by a client over the websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

/// Frame sent by the server over the websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Event { event: String, data: Envelope },
    Ack { ack: u64, data: Acknowledgement },
}

impl ServerFrame {
    pub fn event(envelope: Envelope) -> Self {
        ServerFrame::Event {
            event: envelope.event_name(),
            data: envelope,
        }
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            ServerFrame::Event { data, .. } => Some(data),
            ServerFrame::Ack { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let envelope = Envelope::server(
            ActorKind::Writer,
            Modifier::Chunk,
            "r1",
            StreamId::new(),
            3,
            json!({"delta": "hello"}),
        );
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_wire_keys_are_camel_case() {
        let envelope = Envelope::start(ActorKind::Writer, "r1", json!({}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["direction"], "c2s");
        assert_eq!(value["modifier"], "start");
        assert_eq!(value["v"], "1");
        assert!(value.get("streamId").is_none());
    }

    #[test]
    fn test_decode_fills_defaults() {
        let envelope = decode(
            r#"{"requestId":"r1","direction":"c2s","actor":"writer","action":"stream","modifier":"start","data":{}}"#,
        )
        .unwrap();
        assert_eq!(envelope.v, PROTOCOL_VERSION);
        assert!(!envelope.id.is_empty());
        assert!(envelope.ts > 0);
    }

    #[test]
    fn test_decode_rejects_missing_control_fields() {
        for missing in ["direction", "actor", "action", "modifier"] {
            let mut value = json!({
                "requestId": "r1",
                "direction": "c2s",
                "actor": "writer",
                "action": "stream",
                "modifier": "start",
                "data": {}
            });
            value.as_object_mut().unwrap().remove(missing);
            assert!(
                matches!(decode_value(value), Err(EnvelopeError::Malformed(_))),
                "missing {missing} should be rejected"
            );
        }
    }

    #[test]
    fn test_decode_rejects_start_without_request_id() {
        let err = decode(
            r#"{"direction":"c2s","actor":"writer","action":"stream","modifier":"start","data":{}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingRequestId));

        let err = decode(
            r#"{"requestId":"  ","direction":"c2s","actor":"writer","action":"stream","modifier":"start"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingRequestId));
    }

    #[test]
    fn test_decode_rejects_unknown_actor() {
        let err = decode(
            r#"{"requestId":"r1","direction":"c2s","actor":"poet","action":"stream","modifier":"start"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn test_decode_start_checks_event_actor() {
        let raw = serde_json::to_value(Envelope::start(ActorKind::Coder, "r1", json!({}))).unwrap();
        assert!(decode_start("c2s.coder.stream.start", raw.clone()).is_ok());
        assert!(matches!(
            decode_start("c2s.writer.stream.start", raw.clone()),
            Err(EnvelopeError::ActorMismatch { .. })
        ));
        assert!(matches!(
            decode_start("c2s.coder.stream.stop", raw),
            Err(EnvelopeError::UnknownEvent(_))
        ));
    }

    #[test]
    fn test_event_name() {
        let envelope = Envelope::server(
            ActorKind::Claude,
            Modifier::End,
            "r1",
            StreamId::new(),
            1,
            json!({}),
        );
        assert_eq!(envelope.event_name(), "s2c.claude.stream.end");
        assert_eq!(ActorKind::Assistant.start_event(), "c2s.assistant.stream.start");
        assert_eq!(
            parse_start_event("c2s.assistant.stream.start"),
            Some(ActorKind::Assistant)
        );
        assert_eq!(parse_start_event("c2s.assistant.stream.start.extra"), None);
    }

    #[test]
    fn test_ack_wire_shape() {
        let stream_id = StreamId::new();
        let ok = serde_json::to_value(Acknowledgement::ok("r1", stream_id)).unwrap();
        assert_eq!(ok["ok"], true);
        assert_eq!(ok["requestId"], "r1");
        assert_eq!(ok["streamId"], stream_id.to_string());

        let fail = serde_json::to_value(Acknowledgement::fail(
            ErrorCode::InvalidEnvelope,
            "The envelope is missing request_id",
        ))
        .unwrap();
        assert_eq!(fail["ok"], false);
        assert_eq!(fail["error"]["code"], "invalid_envelope");
        assert!(fail.get("streamId").is_none());
    }

    #[test]
    fn test_server_frames_deserialize() {
        let ack: ServerFrame = serde_json::from_str(
            r#"{"ack":7,"data":{"ok":false,"error":{"code":"invalid_data","message":"no"}}}"#,
        )
        .unwrap();
        assert_eq!(
            ack,
            ServerFrame::Ack {
                ack: 7,
                data: Acknowledgement::fail(ErrorCode::InvalidData, "no"),
            }
        );

        let envelope = Envelope::server(
            ActorKind::Writer,
            Modifier::Chunk,
            "r1",
            StreamId::new(),
            1,
            json!({"delta": "x"}),
        );
        let text = serde_json::to_string(&ServerFrame::event(envelope.clone())).unwrap();
        let frame: ServerFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.envelope(), Some(&envelope));
    }
}
