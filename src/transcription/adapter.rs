use super::{AudioSink, BackendResult, TextMode, TranscriptEvent, TranscriptionBackend};
use crate::audio::{ChunkBuffer, FrameSplitter};
use crate::conversation::Conversation;
use crate::error::RelayError;
use crate::protocol::OutboundMessage;
use crate::router::EventRouter;
use crate::session::SessionCounters;
use chrono::Utc;
use futures::stream::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// Consecutive frame send failures tolerated before the stream is declared dead.
const MAX_CONSECUTIVE_SEND_FAILURES: u32 = 3;

/// Turns raw backend results into canonical utterance text.
///
/// Tracks the last finalized cumulative transcript so that backends which
/// report session-cumulative text yield per-utterance text. Assigns
/// `<session>-<n>` result ids to backends that do not tag their results.
#[derive(Debug)]
pub struct TranscriptAssembler {
    session_id: String,
    mode: TextMode,
    last_emitted_transcript: String,
    utterance_seq: u64,
    /// Id and last forwarded text of the utterance still awaiting its final
    open_utterance: Option<(String, String)>,
}

impl TranscriptAssembler {
    pub fn new(session_id: impl Into<String>, mode: TextMode) -> Self {
        Self {
            session_id: session_id.into(),
            mode,
            last_emitted_transcript: String::new(),
            utterance_seq: 0,
            open_utterance: None,
        }
    }

    /// Returns `(result_id, text, is_final)` or `None` when there is nothing
    /// worth forwarding.
    pub fn accept(&mut self, result: BackendResult) -> Option<(String, String, bool)> {
        let result_id = result
            .result_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.session_id, self.utterance_seq));

        let text = match self.mode {
            TextMode::PerUtterance => result.text.as_str(),
            TextMode::SessionCumulative => {
                match result.text.strip_prefix(self.last_emitted_transcript.as_str()) {
                    Some(rest) => rest,
                    None => {
                        // The backend rewrote already-finalized text; forward it whole.
                        debug!(
                            session_id = %self.session_id,
                            "cumulative transcript diverged from last final"
                        );
                        result.text.as_str()
                    }
                }
            }
        }
        .trim()
        .to_string();

        // A blank final still closes an utterance whose partials went out.
        let text = match self.open_utterance.take() {
            Some((open_id, last)) if result.is_final && text.is_empty() && open_id == result_id => last,
            Some(open) if !result.is_final && text.is_empty() => {
                self.open_utterance = Some(open);
                text
            }
            _ => text,
        };
        if !result.is_final && !text.is_empty() {
            self.open_utterance = Some((result_id.clone(), text.clone()));
        }

        if result.is_final {
            self.last_emitted_transcript = match self.mode {
                TextMode::SessionCumulative => result.text.clone(),
                TextMode::PerUtterance => text.clone(),
            };
            self.utterance_seq += 1;
        }

        if text.is_empty() {
            return None;
        }
        Some((result_id, text, result.is_final))
    }

    pub fn last_emitted_transcript(&self) -> &str {
        &self.last_emitted_transcript
    }
}

/// How a stream ended.
#[derive(Debug)]
pub enum AdapterExit {
    /// Audio drained, backend closed its result stream.
    Completed,
    /// The backend stream died; the session must be torn down.
    Failed(RelayError),
}

/// Drives one backend stream for one session.
pub struct StreamAdapter {
    pub session_id: String,
    pub client_id: String,
    pub backend: Arc<dyn TranscriptionBackend>,
    pub buffer: Arc<ChunkBuffer>,
    pub frame_bytes: usize,
    pub counters: Arc<SessionCounters>,
    pub transcript: Arc<Mutex<Conversation>>,
    pub router: EventRouter,
}

impl StreamAdapter {
    /// Open the backend stream, then run the production task and the
    /// consumption loop until the buffer is drained and the backend has
    /// closed its result stream.
    pub async fn run(self) -> AdapterExit {
        let stream = match self.backend.open_stream(&self.session_id).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(session_id = %self.session_id, "failed to open {} stream: {:#}", self.backend.name(), e);
                return AdapterExit::Failed(RelayError::backend(format!("{:#}", e)));
            }
        };

        info!(
            session_id = %self.session_id,
            backend = self.backend.name(),
            "transcription stream opened"
        );
        self.router
            .route(&self.session_id, &self.client_id, OutboundMessage::started(&self.session_id))
            .await;

        let producer = Producer {
            session_id: self.session_id.clone(),
            client_id: self.client_id.clone(),
            buffer: Arc::clone(&self.buffer),
            sink: stream.sink,
            splitter: FrameSplitter::new(self.frame_bytes),
            counters: Arc::clone(&self.counters),
            router: self.router.clone(),
        };
        // Aborted with this future so a cancelled stream releases the sink.
        let mut production = AbortOnDrop(tokio::spawn(producer.run()));
        let mut production_done = false;

        let mut results = stream.results;
        let mut assembler = TranscriptAssembler::new(self.session_id.clone(), self.backend.text_mode());

        loop {
            tokio::select! {
                item = results.next() => match item {
                    Some(Ok(result)) => {
                        if let Some((result_id, text, is_final)) = assembler.accept(result) {
                            self.emit(result_id, text, is_final).await;
                        }
                    }
                    Some(Err(e)) => {
                        error!(session_id = %self.session_id, "transcription stream failed: {:#}", e);
                        production.abort();
                        return AdapterExit::Failed(RelayError::backend(format!("{:#}", e)));
                    }
                    None => break,
                },
                joined = &mut production, if !production_done => {
                    production_done = true;
                    match joined {
                        Ok(Ok(())) => debug!(session_id = %self.session_id, "audio fully sent, awaiting trailing results"),
                        Ok(Err(e)) => return AdapterExit::Failed(e),
                        Err(e) => {
                            error!(session_id = %self.session_id, "production task panicked: {}", e);
                            return AdapterExit::Failed(RelayError::backend(e));
                        }
                    }
                }
            }
        }

        if !production_done {
            production.abort();
            if !self.buffer.is_closed() {
                warn!(session_id = %self.session_id, "backend closed the stream while audio was still flowing");
                return AdapterExit::Failed(RelayError::backend("stream closed by backend"));
            }
        }

        info!(
            session_id = %self.session_id,
            last_final = assembler.last_emitted_transcript(),
            "transcription stream closed"
        );
        AdapterExit::Completed
    }

    async fn emit(&self, result_id: String, text: String, is_final: bool) {
        let event = TranscriptEvent {
            result_id,
            text,
            is_final,
            timestamp: Utc::now(),
            client_id: self.client_id.clone(),
        };

        {
            let mut transcript = self.transcript.lock().unwrap_or_else(|e| e.into_inner());
            transcript.apply(&event);
        }
        self.counters.record_event();

        debug!(
            session_id = %self.session_id,
            result_id = %event.result_id,
            is_final,
            "transcript event"
        );
        self.router
            .route(
                &self.session_id,
                &self.client_id,
                OutboundMessage::TranscriptionResult(event),
            )
            .await;
    }
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    fn abort(&self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The half that feeds buffered audio into the backend.
struct Producer {
    session_id: String,
    client_id: String,
    buffer: Arc<ChunkBuffer>,
    sink: Box<dyn AudioSink>,
    splitter: FrameSplitter,
    counters: Arc<SessionCounters>,
    router: EventRouter,
}

impl Producer {
    async fn run(mut self) -> Result<(), RelayError> {
        let mut failures = 0u32;

        while let Some(chunk) = self.buffer.next().await {
            for frame in self.splitter.push(&chunk) {
                self.send_frame(&frame, &mut failures).await?;
            }
        }

        if let Some(frame) = self.splitter.flush() {
            self.send_frame(&frame, &mut failures).await?;
        }

        self.sink
            .finish()
            .await
            .map_err(|e| RelayError::backend(format!("{:#}", e)))?;
        debug!(session_id = %self.session_id, "audio stream finished");
        Ok(())
    }

    async fn send_frame(&mut self, frame: &[u8], failures: &mut u32) -> Result<(), RelayError> {
        match self.sink.send_audio(frame).await {
            Ok(()) => {
                *failures = 0;
                self.counters.record_frame(frame.len());
                Ok(())
            }
            Err(e) => {
                *failures += 1;
                let err = RelayError::backend(format!("{:#}", e));
                if *failures >= MAX_CONSECUTIVE_SEND_FAILURES {
                    return Err(err);
                }

                warn!(session_id = %self.session_id, attempt = *failures, "frame send failed: {:#}", e);
                let transient = OutboundMessage::TranscriptionError(crate::protocol::TranscriptionError {
                    error: err.to_string(),
                    timestamp: Utc::now(),
                    fatal: false,
                });
                self.router
                    .route(&self.session_id, &self.client_id, transient)
                    .await;
                Ok(())
            }
        }
    }
}
