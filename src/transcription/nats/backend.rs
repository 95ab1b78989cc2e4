use super::messages::{AudioFrameMessage, TranscriptMessage};
use crate::config::BackendConfig;
use crate::transcription::{AudioSink, BackendResult, BackendStream, TextMode, TranscriptionBackend};
use anyhow::{anyhow, Context, Result};
use async_nats::{Client, Subscriber};
use base64::Engine;
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct NatsBackend {
    client: Client,
    audio_subject_prefix: String,
    transcript_subject: String,
    sample_rate: u32,
    text_mode: TextMode,
    drain_grace: Duration,
}

impl NatsBackend {
    /// Connect to NATS server
    pub async fn connect(config: &BackendConfig, sample_rate: u32) -> Result<Self> {
        info!("Connecting to NATS at {}", config.nats_url);

        let client = async_nats::connect(config.nats_url.as_str())
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self {
            client,
            audio_subject_prefix: config.audio_subject_prefix.clone(),
            transcript_subject: config.transcript_subject.clone(),
            sample_rate,
            text_mode: config.text_mode,
            drain_grace: Duration::from_millis(config.drain_grace_ms),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Session ids end up in subjects; keep them to a single subject token.
pub(crate) fn subject_token(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait::async_trait]
impl TranscriptionBackend for NatsBackend {
    async fn open_stream(&self, session_id: &str) -> Result<BackendStream> {
        // Subscribe before the first frame goes out so no transcript is missed.
        let subscriber = self
            .client
            .subscribe(self.transcript_subject.clone())
            .await
            .context("Failed to subscribe to transcripts")?;

        debug!("Subscribed to {} for session {}", self.transcript_subject, session_id);

        let (finished_tx, finished_rx) = watch::channel(false);

        let sink = NatsSink {
            client: self.client.clone(),
            subject: format!("{}.{}", self.audio_subject_prefix, subject_token(session_id)),
            session_id: session_id.to_string(),
            sample_rate: self.sample_rate,
            sequence: 0,
            finished: finished_tx,
        };

        let state = ResultState {
            subscriber,
            session_id: session_id.to_string(),
            finished: finished_rx,
            finishing: false,
            drain_grace: self.drain_grace,
            done: false,
        };
        let results = futures::stream::unfold(state, next_result).boxed();

        Ok(BackendStream {
            sink: Box::new(sink),
            results,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }

    fn text_mode(&self) -> TextMode {
        self.text_mode
    }
}

struct NatsSink {
    client: Client,
    subject: String,
    session_id: String,
    sample_rate: u32,
    sequence: u32,
    finished: watch::Sender<bool>,
}

impl NatsSink {
    async fn publish(&mut self, pcm_bytes: &[u8], is_final: bool) -> Result<()> {
        let message = AudioFrameMessage {
            session_id: self.session_id.clone(),
            sequence: self.sequence,
            pcm: base64::engine::general_purpose::STANDARD.encode(pcm_bytes),
            sample_rate: self.sample_rate,
            channels: 1,
            timestamp: chrono::Utc::now().to_rfc3339(),
            final_frame: is_final,
        };

        let payload = serde_json::to_vec(&message)?;

        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .context("Failed to publish audio frame")?;

        debug!(
            "Published audio frame to {} (seq={}, bytes={}, final={})",
            self.subject,
            self.sequence,
            pcm_bytes.len(),
            is_final
        );
        self.sequence += 1;

        Ok(())
    }
}

#[async_trait::async_trait]
impl AudioSink for NatsSink {
    async fn send_audio(&mut self, frame: &[u8]) -> Result<()> {
        self.publish(frame, false).await
    }

    async fn finish(&mut self) -> Result<()> {
        self.publish(&[], true).await?;
        self.client
            .flush()
            .await
            .context("Failed to flush NATS connection")?;
        let _ = self.finished.send(true);
        Ok(())
    }
}

struct ResultState {
    subscriber: Subscriber,
    session_id: String,
    finished: watch::Receiver<bool>,
    finishing: bool,
    drain_grace: Duration,
    done: bool,
}

/// Pull the next transcript for this session.
///
/// Ends on an `end_of_stream` message, or once the audio stream has finished
/// and no transcript arrived within the drain grace period.
async fn next_result(mut state: ResultState) -> Option<(Result<BackendResult>, ResultState)> {
    loop {
        if state.done {
            return None;
        }

        let msg = if state.finishing {
            match tokio::time::timeout(state.drain_grace, state.subscriber.next()).await {
                Ok(msg) => msg,
                Err(_) => {
                    debug!(session_id = %state.session_id, "drain grace elapsed, closing transcript stream");
                    return None;
                }
            }
        } else {
            tokio::select! {
                msg = state.subscriber.next() => msg,
                changed = state.finished.changed() => {
                    // A dropped sender means the sink is gone; drain and close either way.
                    if changed.is_err() || *state.finished.borrow() {
                        state.finishing = true;
                    }
                    continue;
                }
            }
        };

        let Some(msg) = msg else {
            state.done = true;
            return Some((Err(anyhow!("transcript subscription closed")), state));
        };

        let transcript = match serde_json::from_slice::<TranscriptMessage>(&msg.payload) {
            Ok(transcript) => transcript,
            Err(e) => {
                warn!("Failed to parse transcript message: {}", e);
                continue;
            }
        };

        // Filter by session_id
        if transcript.session_id != state.session_id {
            continue;
        }

        if transcript.end_of_stream {
            state.done = true;
            if transcript.text.trim().is_empty() {
                return None;
            }
        }

        let result = BackendResult {
            result_id: transcript.segment_id,
            text: transcript.text,
            is_final: !transcript.partial || transcript.end_of_stream,
        };
        return Some((Ok(result), state));
    }
}
