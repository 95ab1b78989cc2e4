//! WebSocket connection gateway.
//!
//! One connection per client. Inbound JSON messages (`startRecording`,
//! `audioChunk`, `stopTranscriptionStream`/`stopRecording`) and binary PCM
//! frames drive the session manager; outbound messages reach the client
//! through the connection registry.

use crate::audio::AudioChunk;
use crate::error::RelayError;
use crate::http::AppState;
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::session::{SessionManager, StopOutcome};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.manager))
}

/// Per-connection state.
struct Connection {
    client_id: String,
    /// Session targeted by audio chunks; defaults to the client id
    session_id: String,
    manager: SessionManager,
}

impl Connection {
    async fn handle(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::StartRecording { session_id } => {
                if let Some(session_id) = session_id.filter(|id| !id.trim().is_empty()) {
                    self.session_id = session_id;
                }
                debug!(
                    client_id = %self.client_id,
                    session_id = %self.session_id,
                    "recording requested, stream starts with first chunk"
                );
            }
            InboundMessage::AudioChunk(payload) => {
                let chunk = AudioChunk::try_from(payload);
                self.on_audio(chunk).await;
            }
            InboundMessage::StopTranscriptionStream { session_id }
            | InboundMessage::StopRecording { session_id } => {
                let session_id = session_id
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| self.session_id.clone());
                self.on_stop(&session_id).await;
            }
        }
    }

    async fn on_audio(&self, chunk: Result<AudioChunk, RelayError>) {
        let result = match chunk {
            Ok(chunk) => {
                self.manager
                    .push_chunk(&self.session_id, &self.client_id, chunk)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(report) if report.started => {
                info!(client_id = %self.client_id, session_id = %self.session_id, "session started on first chunk");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(client_id = %self.client_id, session_id = %self.session_id, "audio chunk rejected: {}", e);
                self.send_error(&e).await;
            }
        }
    }

    async fn on_stop(&self, session_id: &str) {
        if let Some(session) = self.manager.get(session_id).await {
            if session.client_id() != self.client_id {
                self.send_error(&RelayError::SessionOwned(session_id.to_string()))
                    .await;
                return;
            }
        }

        match self.manager.stop(session_id).await {
            StopOutcome::Stopped(stats) => {
                info!(
                    client_id = %self.client_id,
                    session_id = %session_id,
                    chunks = stats.chunks_received,
                    events = stats.events_emitted,
                    "recording stopped"
                );
                self.manager
                    .router()
                    .route(session_id, &self.client_id, OutboundMessage::stopped(session_id))
                    .await;
            }
            StopOutcome::NotActive => {
                debug!(client_id = %self.client_id, session_id = %session_id, "stop ignored, no active session");
            }
        }
    }

    /// Sends a transient error straight to this connection.
    async fn send_error(&self, err: &RelayError) {
        self.manager
            .router()
            .send_direct(&self.client_id, &OutboundMessage::error(err))
            .await;
    }
}

/// Handles the WebSocket connection.
async fn handle_socket(socket: WebSocket, manager: SessionManager) {
    let client_id = format!("conn-{}", Uuid::new_v4());
    let registry = manager.router().registry().clone();

    let (mut sender, mut receiver) = socket.split();

    // Bounded so a slow client applies backpressure to its own session only.
    let (tx, mut rx) = mpsc::channel::<String>(manager.settings().outbound_queue.max(1));
    let connection_id = registry.register(client_id.clone(), tx).await;

    info!(client_id = %client_id, "client connected");

    // Forward queued messages to the websocket sender
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection {
        session_id: client_id.clone(),
        client_id: client_id.clone(),
        manager: manager.clone(),
    };

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<InboundMessage>(&text) {
                Ok(incoming) => connection.handle(incoming).await,
                Err(e) => {
                    warn!(client_id = %client_id, "failed to parse incoming message: {}", e);
                    connection
                        .send_error(&RelayError::InvalidMessage(e.to_string()))
                        .await;
                }
            },
            Message::Binary(data) => connection.on_audio(AudioChunk::from_raw(data)).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Nobody is listening anymore: release tracking state first, then run the
    // same stop path as an explicit stop.
    registry.deregister(&client_id, connection_id).await;
    let stopped = manager.stop_client(&client_id).await;
    send_task.abort();

    info!(client_id = %client_id, stopped_sessions = stopped, "client disconnected");
}
