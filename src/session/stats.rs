use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::SessionState;

/// Statistics about a relay session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session_id: String,

    pub state: SessionState,

    /// When the session started
    pub started_at: DateTime<Utc>,

    /// Total duration in seconds
    pub duration_secs: f64,

    /// Audio chunks accepted from the client
    pub chunks_received: usize,

    pub bytes_received: usize,

    /// Fixed-size frames forwarded to the backend
    pub frames_sent: usize,

    pub bytes_sent: usize,

    /// Transcript events delivered
    pub events_emitted: usize,

    /// Chunks the voice-activity scorer flagged as speech
    pub speech_chunks: usize,

    /// Audio evicted by the drop-oldest overflow policy
    pub dropped_bytes: usize,

    /// Bytes still waiting in the chunk buffer
    pub queued_bytes: usize,
}

/// Live counters shared between the gateway, the adapter and VAD callbacks.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub chunks_received: AtomicUsize,
    pub bytes_received: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub events_emitted: AtomicUsize,
    pub speech_chunks: AtomicUsize,
    pub dropped_bytes: AtomicUsize,
}

impl SessionCounters {
    pub fn record_chunk(&self, bytes: usize, dropped: usize) {
        self.chunks_received.fetch_add(1, Ordering::SeqCst);
        self.bytes_received.fetch_add(bytes, Ordering::SeqCst);
        if dropped > 0 {
            self.dropped_bytes.fetch_add(dropped, Ordering::SeqCst);
        }
    }

    pub fn record_frame(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::SeqCst);
        self.bytes_sent.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn record_event(&self) {
        self.events_emitted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_speech(&self) {
        self.speech_chunks.fetch_add(1, Ordering::SeqCst);
    }
}
