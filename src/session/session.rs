use super::config::SessionConfig;
use super::stats::{SessionCounters, SessionStats};
use super::SessionState;
use crate::audio::{AudioChunk, ChunkBuffer, PushOutcome};
use crate::conversation::{Conversation, Utterance};
use crate::error::RelayError;
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One live relay session: its buffer, counters, transcript and the task
/// driving its backend stream.
pub struct RelaySession {
    /// Session configuration
    config: SessionConfig,

    /// Distinguishes this incarnation from a later session with the same id
    generation: Uuid,

    /// When the session started
    started_at: DateTime<Utc>,

    state: Mutex<SessionState>,

    buffer: Arc<ChunkBuffer>,

    counters: Arc<SessionCounters>,

    /// Reassembled transcript so far
    transcript: Arc<Mutex<Conversation>>,

    /// Handle for the stream adapter task; taken by whoever stops the session
    driver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RelaySession {
    pub fn new(config: SessionConfig) -> Self {
        let buffer = ChunkBuffer::new(
            config.session_id.clone(),
            config.buffer_capacity_bytes,
            config.overflow,
        );

        Self {
            config,
            generation: Uuid::new_v4(),
            started_at: Utc::now(),
            state: Mutex::new(SessionState::Streaming),
            buffer: Arc::new(buffer),
            counters: Arc::new(SessionCounters::default()),
            transcript: Arc::new(Mutex::new(Conversation::new())),
            driver: tokio::sync::Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&self, next: SessionState) -> SessionState {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *state, next)
    }

    pub fn buffer(&self) -> &Arc<ChunkBuffer> {
        &self.buffer
    }

    pub fn counters(&self) -> &Arc<SessionCounters> {
        &self.counters
    }

    pub fn transcript(&self) -> &Arc<Mutex<Conversation>> {
        &self.transcript
    }

    pub(super) async fn set_driver(&self, handle: JoinHandle<()>) {
        *self.driver.lock().await = Some(handle);
    }

    /// The lock serializes concurrent stop callers: the second one waits for
    /// the first and then finds no handle left to take.
    pub(super) fn driver(&self) -> &tokio::sync::Mutex<Option<JoinHandle<()>>> {
        &self.driver
    }

    /// Queue one chunk for the backend.
    pub fn push(&self, chunk: &AudioChunk) -> Result<PushOutcome, RelayError> {
        match self.state() {
            SessionState::Streaming => {}
            SessionState::Stopping => {
                return Err(RelayError::SessionStopping(self.session_id().to_string()))
            }
            SessionState::Inactive => {
                return Err(RelayError::SessionClosed(self.session_id().to_string()))
            }
        }

        let outcome = self.buffer.push(chunk.pcm.clone())?;
        self.counters
            .record_chunk(chunk.pcm.len(), outcome.dropped_bytes);
        Ok(outcome)
    }

    /// Drop everything still queued and mark the session inactive.
    pub fn release(&self) -> usize {
        self.transition(SessionState::Inactive);
        self.buffer.discard()
    }

    /// Get current session statistics
    pub fn stats(&self) -> SessionStats {
        let duration = Utc::now().signed_duration_since(self.started_at);
        let counters = &self.counters;

        SessionStats {
            session_id: self.session_id().to_string(),
            state: self.state(),
            started_at: self.started_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            chunks_received: counters.chunks_received.load(Ordering::SeqCst),
            bytes_received: counters.bytes_received.load(Ordering::SeqCst),
            frames_sent: counters.frames_sent.load(Ordering::SeqCst),
            bytes_sent: counters.bytes_sent.load(Ordering::SeqCst),
            events_emitted: counters.events_emitted.load(Ordering::SeqCst),
            speech_chunks: counters.speech_chunks.load(Ordering::SeqCst),
            dropped_bytes: counters.dropped_bytes.load(Ordering::SeqCst),
            queued_bytes: self.buffer.queued_bytes(),
        }
    }

    /// Get accumulated transcript
    pub fn utterances(&self) -> Vec<Utterance> {
        let transcript = self.transcript.lock().unwrap_or_else(|e| e.into_inner());
        transcript.utterances().to_vec()
    }
}
