//! Voice-activity scoring as an auxiliary, best-effort service.
//!
//! Scoring never sits on the transcription path: each call is spawned on its
//! own task with a timeout, and failures are logged and dropped.

use crate::session::SessionCounters;
use crate::transcription::nats::messages::{VadRequest, VadResponse};
use anyhow::{Context, Result};
use async_nats::Client;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait::async_trait]
pub trait VoiceActivityScorer: Send + Sync {
    /// Returns true when the chunk contains speech.
    async fn score(&self, session_id: &str, pcm: &[u8], sound_level: Option<f64>) -> Result<bool>;

    fn name(&self) -> &str;
}

/// Scores chunks through NATS request/reply.
pub struct NatsVadScorer {
    client: Client,
    subject: String,
    sample_rate: u32,
}

impl NatsVadScorer {
    pub fn new(client: Client, subject: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            client,
            subject: subject.into(),
            sample_rate,
        }
    }
}

#[async_trait::async_trait]
impl VoiceActivityScorer for NatsVadScorer {
    async fn score(&self, session_id: &str, pcm: &[u8], sound_level: Option<f64>) -> Result<bool> {
        let request = VadRequest {
            session_id: session_id.to_string(),
            pcm: base64::engine::general_purpose::STANDARD.encode(pcm),
            sample_rate: self.sample_rate,
            sound_level,
        };
        let payload = serde_json::to_vec(&request)?;

        let reply = self
            .client
            .request(self.subject.clone(), payload.into())
            .await
            .context("VAD request failed")?;

        let response: VadResponse =
            serde_json::from_slice(&reply.payload).context("Invalid VAD response")?;
        Ok(response.speech)
    }

    fn name(&self) -> &str {
        "nats-vad"
    }
}

/// Spawn a scoring call for one chunk. The caller never waits on it.
pub fn spawn_score(
    scorer: Arc<dyn VoiceActivityScorer>,
    timeout: Duration,
    session_id: String,
    pcm: Vec<u8>,
    sound_level: Option<f64>,
    counters: Arc<SessionCounters>,
) {
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, scorer.score(&session_id, &pcm, sound_level)).await {
            Ok(Ok(speech)) => {
                if speech {
                    counters.record_speech();
                }
                debug!(session_id = %session_id, speech, "voice activity scored");
            }
            Ok(Err(e)) => {
                warn!(session_id = %session_id, scorer = scorer.name(), "voice activity scoring failed: {:#}", e);
            }
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    scorer = scorer.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "voice activity scoring timed out"
                );
            }
        }
    });
}
