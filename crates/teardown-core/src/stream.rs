//! Ordered emission of one stream's envelopes onto a connection queue.
//!
//! A [`StreamEmitter`] owns the sequencer for its stream and pushes framed
//! envelopes into the connection's single outbound queue, so writes for one
//! connection are drained strictly in the order they were produced.

use crate::envelope::{ActorKind, Envelope, ErrorDetails, FinishReason, Modifier, ServerFrame};
use crate::sequencing::{SequenceError, StreamId, StreamSequencer};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Outbound queue of a single connection.
pub type Outbound = mpsc::UnboundedSender<ServerFrame>;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("Connection closed")]
    Closed,

    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

/// Emits `chunk` envelopes and exactly one `end` for one stream.
///
/// Dropping an emitter that never ended sends an `end` carrying an
/// `internal_error`, so a stream is terminated even if its task panics.
pub struct StreamEmitter {
    outbound: Outbound,
    actor: ActorKind,
    request_id: String,
    sequencer: StreamSequencer,
    ready: Option<oneshot::Receiver<()>>,
}

impl StreamEmitter {
    pub fn new(outbound: Outbound, actor: ActorKind, request_id: String, stream_id: StreamId) -> Self {
        Self {
            outbound,
            actor,
            request_id,
            sequencer: StreamSequencer::new(stream_id),
            ready: None,
        }
    }

    /// Create an emitter that holds its first envelope until `ready` fires
    /// (or its sender is dropped). Used to keep the acknowledgement ahead of
    /// any chunk on the wire.
    pub fn gated(
        outbound: Outbound,
        actor: ActorKind,
        request_id: String,
        stream_id: StreamId,
        ready: oneshot::Receiver<()>,
    ) -> Self {
        let mut emitter = Self::new(outbound, actor, request_id, stream_id);
        emitter.ready = Some(ready);
        emitter
    }

    pub fn stream_id(&self) -> StreamId {
        self.sequencer.stream_id()
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn actor(&self) -> ActorKind {
        self.actor
    }

    /// Sequence number of the last emitted envelope (0 before any).
    pub fn last_seq(&self) -> u64 {
        self.sequencer.last_seq()
    }

    async fn wait_ready(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.await;
        }
    }

    /// Emit a `chunk` with an arbitrary payload.
    pub async fn chunk(&mut self, data: Value) -> Result<u64, EmitError> {
        self.wait_ready().await;
        let seq = self.sequencer.next_chunk()?;
        self.send(Modifier::Chunk, seq, data, None)?;
        Ok(seq)
    }

    /// Emit a `chunk` carrying a text delta.
    pub async fn delta(&mut self, text: impl Into<String>) -> Result<u64, EmitError> {
        self.chunk(json!({ "delta": text.into() })).await
    }

    /// Terminate the stream normally.
    pub async fn finish(mut self) -> Result<u64, EmitError> {
        self.wait_ready().await;
        self.end(FinishReason::Stop, None)
    }

    /// Terminate the stream with an error.
    pub async fn fail(mut self, error: ErrorDetails) -> Result<u64, EmitError> {
        self.wait_ready().await;
        self.end(FinishReason::Error, Some(error))
    }

    fn end(&mut self, reason: FinishReason, error: Option<ErrorDetails>) -> Result<u64, EmitError> {
        let seq = self.sequencer.next_end()?;
        self.send(Modifier::End, seq, json!({ "finishReason": reason }), error)?;
        tracing::debug!(
            "Stream {} ({}) ended with {:?} at seq {}",
            self.stream_id(),
            self.request_id,
            reason,
            seq
        );
        Ok(seq)
    }

    fn send(
        &self,
        modifier: Modifier,
        seq: u64,
        data: Value,
        error: Option<ErrorDetails>,
    ) -> Result<(), EmitError> {
        let mut envelope = Envelope::server(
            self.actor,
            modifier,
            &self.request_id,
            self.stream_id(),
            seq,
            data,
        );
        envelope.error = error;
        self.outbound
            .send(ServerFrame::event(envelope))
            .map_err(|_| EmitError::Closed)
    }
}

impl Drop for StreamEmitter {
    fn drop(&mut self) {
        if self.sequencer.phase() == crate::sequencing::StreamPhase::Ended {
            return;
        }
        tracing::warn!(
            "Stream {} dropped without an end; terminating with internal_error",
            self.stream_id()
        );
        let _ = self.end(
            FinishReason::Error,
            Some(ErrorDetails::new(
                crate::envelope::ErrorCode::InternalError,
                "Stream terminated unexpectedly",
            )),
        );
    }
}
