//! HTTP and websocket routes.

use crate::dispatcher;
use crate::state::AppState;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use teardown_core::envelope::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Reply};

/// Create all routes.
pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let socket = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_state(state.clone()))
        .map(|ws: warp::ws::Ws, state: AppState| {
            ws.on_upgrade(move |socket| handle_client_socket(socket, state))
        });

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state))
        .and_then(health);

    socket.or(health)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
}

async fn health(state: AppState) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&HealthResponse {
        status: "ok",
        connections: state.connection_count().await,
    }))
}

// ============================================================================
// Client websocket
// ============================================================================

async fn handle_client_socket(ws: WebSocket, state: AppState) {
    let (mut sink, mut stream) = ws.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let connection = state.register_connection(outbound_tx).await;
    tracing::info!("Client connected: {}", connection.id);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let payload = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("Failed to serialize frame for client write: {}", e);
                    continue;
                }
            };
            if sink.send(Message::text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(incoming) = stream.next().await {
        let Ok(message) = incoming else {
            break;
        };
        if message.is_close() {
            break;
        }
        if !message.is_text() {
            continue;
        }

        let text = match message.to_str() {
            Ok(t) => t,
            Err(_) => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Failed to decode frame from {}: {}", connection.id, e);
                continue;
            }
        };

        dispatcher::handle_frame(
            state.actors(),
            &connection,
            &frame.event,
            frame.ack,
            frame.data,
        )
        .await;
    }

    state.unregister_connection(connection.id).await;
    writer.abort();
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}
