use super::state::AppState;
use crate::audio::{AudioChunk, AudioChunkPayload};
use crate::error::RelayError;
use crate::protocol::OutboundMessage;
use crate::router::RoutedEvent;
use crate::session::{SessionStats, StartOutcome, StopOutcome};
use crate::transcription::TranscriptEvent;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    /// Optional session ID (if not provided, generate UUID)
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub accepted: bool,
    /// This chunk started the session
    pub started: bool,
    pub dropped_bytes: usize,
    /// Transcript fragment produced while the request waited, if any
    pub fragment: Option<TranscriptEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionResponse {
    pub session_id: String,
    pub status: String,
    pub message: String,
    pub stats: Option<SessionStats>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

fn relay_error_response(err: &RelayError) -> Response {
    let status = match err {
        RelayError::InvalidAudio(_) | RelayError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
        RelayError::SessionStopping(_) | RelayError::SessionOwned(_) => StatusCode::CONFLICT,
        RelayError::SessionClosed(_) => StatusCode::GONE,
        RelayError::BufferFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Backend(_) => StatusCode::BAD_GATEWAY,
    };
    error_response(status, err.to_string())
}

fn not_found(session_id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        format!("Session {} not found", session_id),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /sessions
/// Start a session (idempotent). Over this transport the session id doubles
/// as the client id.
pub async fn start_session(
    State(state): State<AppState>,
    body: Option<Json<StartSessionRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let session_id = req
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()));

    let outcome = state.manager.start(&session_id, &session_id).await;
    let (status, message) = match outcome {
        StartOutcome::Started => {
            info!("Started session over HTTP: {}", session_id);
            ("streaming", format!("Session {} started", session_id))
        }
        StartOutcome::AlreadyActive => (
            "streaming",
            format!("Session {} is already streaming", session_id),
        ),
    };

    (
        StatusCode::OK,
        Json(StartSessionResponse {
            session_id,
            status: status.to_string(),
            message,
        }),
    )
}

/// POST /sessions/:session_id/chunks
/// Push one audio chunk and return the fragment it produced, if one arrives
/// within the configured wait.
pub async fn push_chunk(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<AudioChunkPayload>,
) -> Response {
    let chunk = match AudioChunk::try_from(payload) {
        Ok(chunk) => chunk,
        Err(e) => return relay_error_response(&e),
    };

    // Subscribe before pushing so the fragment cannot slip past.
    let mut feed = state.manager.router().subscribe();

    let report = match state
        .manager
        .push_chunk(&session_id, &session_id, chunk)
        .await
    {
        Ok(report) => report,
        Err(e) => {
            warn!("Chunk rejected for session {}: {}", session_id, e);
            return relay_error_response(&e);
        }
    };

    let wait = state.manager.settings().chunk_response_wait();
    let fragment = tokio::time::timeout(wait, next_fragment(&mut feed, &session_id))
        .await
        .ok()
        .flatten();

    (
        StatusCode::OK,
        Json(ChunkResponse {
            accepted: true,
            started: report.started,
            dropped_bytes: report.dropped_bytes,
            fragment,
        }),
    )
        .into_response()
}

async fn next_fragment(feed: &mut Receiver<RoutedEvent>, session_id: &str) -> Option<TranscriptEvent> {
    loop {
        match feed.recv().await {
            Ok(RoutedEvent {
                session_id: ref id,
                message: OutboundMessage::TranscriptionResult(event),
                ..
            }) if id == session_id => return Some(event),
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

/// POST /sessions/:session_id/stop
/// Stop a session; responds only after the backend stream has drained and closed
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    info!("Stopping session over HTTP: {}", session_id);

    match state.manager.stop(&session_id).await {
        StopOutcome::Stopped(stats) => {
            let client_id = session_id.clone();
            state
                .manager
                .router()
                .route(&session_id, &client_id, OutboundMessage::stopped(&session_id))
                .await;
            Json(StopSessionResponse {
                message: format!("Session {} stopped", session_id),
                session_id,
                status: "stopped".to_string(),
                stats: Some(stats),
            })
        }
        StopOutcome::NotActive => Json(StopSessionResponse {
            message: format!("Session {} is not active", session_id),
            session_id,
            status: "inactive".to_string(),
            stats: None,
        }),
    }
}

/// GET /sessions/:session_id/events
/// Server-sent events for one session; ends after `recordingStopped` or a
/// fatal `transcriptionError`
pub async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let feed = state.manager.router().subscribe();

    let stream = futures::stream::unfold((feed, session_id, false), |(mut feed, session_id, done)| async move {
        if done {
            return None;
        }
        loop {
            match feed.recv().await {
                Ok(routed) if routed.session_id == session_id => {
                    let last = match &routed.message {
                        OutboundMessage::RecordingStopped(_) => true,
                        OutboundMessage::TranscriptionError(e) => e.fatal,
                        _ => false,
                    };
                    match Event::default()
                        .event(routed.message.kind())
                        .json_data(&routed.message)
                    {
                        Ok(event) => return Some((Ok::<_, Infallible>(event), (feed, session_id, last))),
                        Err(e) => error!("Failed to encode event for session {}: {}", session_id, e),
                    }
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event feed for session {} lagged, skipped {} events", session_id, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /sessions/:session_id/status
/// Get statistics of a live session
pub async fn get_session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.manager.stats(&session_id).await {
        Some(stats) => (StatusCode::OK, Json(stats)).into_response(),
        None => not_found(&session_id),
    }
}

/// GET /sessions/:session_id/transcript
/// Get transcript for a session (accumulated so far)
pub async fn get_session_transcript(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.manager.transcript(&session_id).await {
        Some(transcript) => (StatusCode::OK, Json(transcript)).into_response(),
        None => not_found(&session_id),
    }
}

/// GET /sessions
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.manager.active_sessions().await;
    Json(serde_json::json!({ "sessions": sessions }))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
