use thiserror::Error;

/// Errors surfaced by the relay to connected clients.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid audio chunk: {0}")]
    InvalidAudio(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Audio buffer full for session {session_id} ({queued_bytes} bytes queued)")]
    BufferFull {
        session_id: String,
        queued_bytes: usize,
    },

    #[error("Session {0} is stopping and no longer accepts audio")]
    SessionStopping(String),

    #[error("Session {0} is closed")]
    SessionClosed(String),

    #[error("Session {0} belongs to another connection")]
    SessionOwned(String),

    #[error("Transcription backend error: {0}")]
    Backend(String),
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorKind {
    /// Local to one chunk or request; the session stays alive.
    Transient,
    /// The session's backend stream is dead and must be restarted by the client.
    SessionFatal,
}

impl RelayError {
    pub fn kind(&self) -> RelayErrorKind {
        match self {
            RelayError::Backend(_) => RelayErrorKind::SessionFatal,
            RelayError::InvalidAudio(_)
            | RelayError::InvalidMessage(_)
            | RelayError::BufferFull { .. }
            | RelayError::SessionStopping(_)
            | RelayError::SessionClosed(_)
            | RelayError::SessionOwned(_) => RelayErrorKind::Transient,
        }
    }

    pub fn backend(err: impl std::fmt::Display) -> Self {
        RelayError::Backend(err.to_string())
    }
}
