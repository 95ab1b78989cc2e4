use crate::config::{OverflowPolicy, RelayConfig};
use serde::{Deserialize, Serialize};

/// Configuration for a relay session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Unique session identifier (e.g., "game-2025-10-28-catan")
    pub session_id: String,

    /// Connection that owns the session and receives its events
    pub client_id: String,

    /// Upper bound on queued audio
    pub buffer_capacity_bytes: usize,

    pub overflow: OverflowPolicy,

    /// Frame size forwarded to the backend
    pub frame_bytes: usize,
}

impl SessionConfig {
    pub fn new(session_id: impl Into<String>, client_id: impl Into<String>, relay: &RelayConfig) -> Self {
        Self {
            session_id: session_id.into(),
            client_id: client_id.into(),
            buffer_capacity_bytes: relay.buffer_capacity_bytes,
            overflow: relay.overflow,
            frame_bytes: relay.frame_bytes,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let session_id = format!("session-{}", uuid::Uuid::new_v4());
        Self::new(session_id.clone(), session_id, &RelayConfig::default())
    }
}
