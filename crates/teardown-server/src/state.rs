//! Process-scoped registry of client connections and their live streams.

use crate::actors::ActorRegistry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use teardown_core::envelope::{Acknowledgement, ActorKind, ServerFrame};
use teardown_core::sequencing::StreamId;
use teardown_core::stream::{Outbound, StreamEmitter};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Request {0} already has a live stream on this connection")]
    DuplicateRequest(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

#[derive(Debug)]
struct LiveStream {
    request_id: String,
    cancel: CancellationToken,
    gate: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
struct ConnectionStreams {
    closed: bool,
    by_id: HashMap<StreamId, LiveStream>,
}

/// One client connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub connected_at: DateTime<Utc>,
    outbound: Outbound,
    streams: Arc<Mutex<ConnectionStreams>>,
}

impl Connection {
    fn new(outbound: Outbound) -> Self {
        Self {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            outbound,
            streams: Arc::new(Mutex::new(ConnectionStreams::default())),
        }
    }

    /// Mint a stream for `request_id` and return its emitter.
    ///
    /// The emitter holds its first envelope until [`Connection::send_ack`]
    /// has queued the acknowledgement for this stream.
    pub async fn open_stream(
        &self,
        actor: ActorKind,
        request_id: &str,
    ) -> Result<(StreamEmitter, CancellationToken), StateError> {
        let mut streams = self.streams.lock().await;
        if streams.closed {
            return Err(StateError::ConnectionClosed);
        }
        if streams.by_id.values().any(|s| s.request_id == request_id) {
            return Err(StateError::DuplicateRequest(request_id.to_string()));
        }

        let stream_id = StreamId::new();
        let cancel = CancellationToken::new();
        let (gate_tx, gate_rx) = oneshot::channel();
        streams.by_id.insert(
            stream_id,
            LiveStream {
                request_id: request_id.to_string(),
                cancel: cancel.clone(),
                gate: Some(gate_tx),
            },
        );
        drop(streams);

        tracing::info!(
            "Connection {} accepted {} stream {} for request {}",
            self.id,
            actor,
            stream_id,
            request_id
        );

        let emitter = StreamEmitter::gated(
            self.outbound.clone(),
            actor,
            request_id.to_string(),
            stream_id,
            gate_rx,
        );
        Ok((emitter, cancel))
    }

    /// Queue an acknowledgement, then let the acknowledged stream emit.
    ///
    /// Without an `ack_id` the client asked for no reply; the stream is
    /// released all the same.
    pub async fn send_ack(&self, ack_id: Option<u64>, ack: Acknowledgement) {
        let stream_id = ack.stream_id();
        if let Some(ack_id) = ack_id {
            if self
                .outbound
                .send(ServerFrame::Ack {
                    ack: ack_id,
                    data: ack,
                })
                .is_err()
            {
                tracing::debug!("Connection {} closed before ack {}", self.id, ack_id);
            }
        }

        if let Some(stream_id) = stream_id {
            let mut streams = self.streams.lock().await;
            if let Some(gate) = streams
                .by_id
                .get_mut(&stream_id)
                .and_then(|s| s.gate.take())
            {
                let _ = gate.send(());
            }
        }
    }

    /// Cancel one stream. Returns the request id it belonged to.
    pub async fn cancel_stream(&self, stream_id: StreamId) -> Option<String> {
        let streams = self.streams.lock().await;
        let stream = streams.by_id.get(&stream_id)?;
        stream.cancel.cancel();
        tracing::info!("Connection {} cancelled stream {}", self.id, stream_id);
        Some(stream.request_id.clone())
    }

    /// Forget a stream whose task has completed.
    pub async fn finish_stream(&self, stream_id: StreamId) {
        self.streams.lock().await.by_id.remove(&stream_id);
    }

    pub async fn live_streams(&self) -> usize {
        self.streams.lock().await.by_id.len()
    }

    /// Cancel every live stream and refuse new ones.
    async fn close(&self) {
        let mut streams = self.streams.lock().await;
        streams.closed = true;
        for (stream_id, stream) in streams.by_id.drain() {
            stream.cancel.cancel();
            tracing::debug!("Cancelled stream {} on close of {}", stream_id, self.id);
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<AppStateInner>>,
    actors: Arc<ActorRegistry>,
}

struct AppStateInner {
    connections: HashMap<Uuid, Connection>,
}

impl AppState {
    pub fn new(actors: ActorRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(AppStateInner {
                connections: HashMap::new(),
            })),
            actors: Arc::new(actors),
        }
    }

    pub fn actors(&self) -> &ActorRegistry {
        &self.actors
    }

    pub async fn register_connection(&self, outbound: Outbound) -> Connection {
        let connection = Connection::new(outbound);
        self.inner
            .write()
            .await
            .connections
            .insert(connection.id, connection.clone());
        connection
    }

    /// Remove a connection and cancel all of its streams.
    pub async fn unregister_connection(&self, id: Uuid) {
        let Some(connection) = self.inner.write().await.connections.remove(&id) else {
            return;
        };
        connection.close().await;
        tracing::info!("Connection {} closed", id);
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn state() -> AppState {
        AppState::new(ActorRegistry::empty())
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let state = state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = state.register_connection(tx).await;
        assert_eq!(state.connection_count().await, 1);
        state.unregister_connection(connection.id).await;
        assert_eq!(state.connection_count().await, 0);
        state.unregister_connection(connection.id).await;
    }

    #[tokio::test]
    async fn test_duplicate_live_request_is_rejected() {
        let state = state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = state.register_connection(tx).await;

        let (first, _) = connection.open_stream(ActorKind::Writer, "r1").await.unwrap();
        assert!(matches!(
            connection.open_stream(ActorKind::Writer, "r1").await,
            Err(StateError::DuplicateRequest(_))
        ));
        connection.open_stream(ActorKind::Writer, "r2").await.unwrap();

        connection.finish_stream(first.stream_id()).await;
        drop(first);
        assert!(connection.open_stream(ActorKind::Writer, "r1").await.is_ok());
    }

    #[tokio::test]
    async fn test_ack_is_queued_before_first_chunk() {
        let state = state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = state.register_connection(tx).await;
        let (mut emitter, _) = connection.open_stream(ActorKind::Writer, "r1").await.unwrap();
        let stream_id = emitter.stream_id();

        let task = tokio::spawn(async move {
            emitter.delta("hi").await.unwrap();
            emitter.finish().await.unwrap();
        });
        tokio::task::yield_now().await;
        connection
            .send_ack(Some(7), Acknowledgement::ok("r1", stream_id))
            .await;
        task.await.unwrap();

        assert!(matches!(rx.recv().await, Some(ServerFrame::Ack { ack: 7, .. })));
        assert!(matches!(rx.recv().await, Some(ServerFrame::Event { .. })));
    }

    #[tokio::test]
    async fn test_close_cancels_streams() {
        let state = state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = state.register_connection(tx).await;
        let (emitter, cancel) = connection.open_stream(ActorKind::Claude, "r1").await.unwrap();

        state.unregister_connection(connection.id).await;
        assert!(cancel.is_cancelled());
        assert!(matches!(
            connection.open_stream(ActorKind::Claude, "r2").await,
            Err(StateError::ConnectionClosed)
        ));
        drop(emitter);
    }

    #[tokio::test]
    async fn test_cancel_stream_reports_request() {
        let state = state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = state.register_connection(tx).await;
        let (emitter, cancel) = connection.open_stream(ActorKind::Claude, "r9").await.unwrap();

        assert_eq!(
            connection.cancel_stream(emitter.stream_id()).await.as_deref(),
            Some("r9")
        );
        assert!(cancel.is_cancelled());
        assert!(connection.cancel_stream(StreamId::new()).await.is_none());
    }
}
