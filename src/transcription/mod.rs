//! Streaming speech-recognition plumbing.
//!
//! A [`TranscriptionBackend`] opens one bidirectional stream per session:
//! an [`AudioSink`] that accepts fixed-size PCM frames and a stream of
//! [`BackendResult`]s. The [`StreamAdapter`] drives both halves and turns
//! backend results into canonical [`TranscriptEvent`]s.

pub mod adapter;
pub mod mock;
pub mod nats;

pub use crate::config::TextMode;
pub use adapter::{AdapterExit, StreamAdapter, TranscriptAssembler};
pub use mock::MockBackend;
pub use nats::NatsBackend;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// One transcript fragment as delivered to clients.
///
/// `text` is always the full text-so-far of the `result_id` utterance; a
/// later event for the same id supersedes an earlier one. Once an event
/// with `is_final` has been sent for an id, no further events use it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub result_id: String,
    pub text: String,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
}

/// A raw result as reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendResult {
    /// Backend-provided utterance id; the adapter assigns one when absent
    pub result_id: Option<String>,
    pub text: String,
    pub is_final: bool,
}

impl BackendResult {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            result_id: None,
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_result(text: impl Into<String>) -> Self {
        Self {
            result_id: None,
            text: text.into(),
            is_final: true,
        }
    }

    pub fn with_id(mut self, result_id: impl Into<String>) -> Self {
        self.result_id = Some(result_id.into());
        self
    }
}

/// Outbound half of a backend stream.
#[async_trait::async_trait]
pub trait AudioSink: Send {
    /// Send one frame of 16-bit PCM.
    async fn send_audio(&mut self, frame: &[u8]) -> Result<()>;

    /// Signal end of audio. The backend flushes and then ends its result stream.
    async fn finish(&mut self) -> Result<()>;
}

pub type ResultStream = BoxStream<'static, Result<BackendResult>>;

/// Both halves of an open backend stream.
pub struct BackendStream {
    pub sink: Box<dyn AudioSink>,
    pub results: ResultStream,
}

/// A streaming speech-recognition service.
#[async_trait::async_trait]
pub trait TranscriptionBackend: Send + Sync {
    /// Open a new stream for a session.
    async fn open_stream(&self, session_id: &str) -> Result<BackendStream>;

    /// Get backend name for logging
    fn name(&self) -> &str;

    /// How this backend reports partial text.
    fn text_mode(&self) -> TextMode {
        TextMode::PerUtterance
    }
}
