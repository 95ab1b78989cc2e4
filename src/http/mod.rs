//! HTTP API server
//!
//! Two transports over the same session state machine:
//! - GET /ws - WebSocket connection gateway
//! - POST /sessions - Start a session
//! - POST /sessions/:id/chunks - Push one audio chunk
//! - POST /sessions/:id/stop - Stop a session (waits for drain)
//! - GET /sessions/:id/events - Server-sent event feed of session output
//! - GET /sessions/:id/status - Query session statistics
//! - GET /sessions/:id/transcript - Get reassembled transcript
//! - GET /sessions - List live sessions
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use handlers::{ChunkResponse, StartSessionRequest, StartSessionResponse, StopSessionResponse};
pub use routes::create_router;
pub use state::AppState;
