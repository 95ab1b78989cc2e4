//! In-process backend for local development and tests.
//!
//! Records every frame it receives, reports a partial result per frame and a
//! final result when the audio stream finishes, then closes its result
//! stream. Failure can be injected after a number of frames.

use super::{AudioSink, BackendResult, BackendStream, TextMode, TranscriptionBackend};
use anyhow::{anyhow, Result};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct Recorded {
    /// session id → every byte received, in order
    audio: HashMap<String, Vec<u8>>,
    /// session id → size of each frame received
    frames: HashMap<String, Vec<usize>>,
    /// session ids whose audio stream was finished
    finished: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    recorded: Arc<Mutex<Recorded>>,
    streams_opened: Arc<AtomicUsize>,
    fail_after_frames: Option<usize>,
    failing_sends: usize,
    fail_open: bool,
    finish_delay: Duration,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a stream error once this many frames have been received.
    pub fn failing_after(mut self, frames: usize) -> Self {
        self.fail_after_frames = Some(frames);
        self
    }

    /// Reject the first `sends` frames of every stream; they are not recorded.
    pub fn failing_sends(mut self, sends: usize) -> Self {
        self.failing_sends = sends;
        self
    }

    /// Refuse to open streams at all.
    pub fn refusing_streams(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Delay the final result after the audio stream finishes, simulating
    /// a backend that is still recognizing trailing audio.
    pub fn with_finish_delay(mut self, delay: Duration) -> Self {
        self.finish_delay = delay;
        self
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every byte received for a session, concatenated in arrival order.
    pub fn received_audio(&self, session_id: &str) -> Vec<u8> {
        self.recorded()
            .audio
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn frame_sizes(&self, session_id: &str) -> Vec<usize> {
        self.recorded()
            .frames
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn finished(&self, session_id: &str) -> bool {
        self.recorded().finished.iter().any(|id| id == session_id)
    }
}

#[async_trait::async_trait]
impl TranscriptionBackend for MockBackend {
    async fn open_stream(&self, session_id: &str) -> Result<BackendStream> {
        if self.fail_open {
            return Err(anyhow!("mock backend refused stream for {}", session_id));
        }
        self.streams_opened.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = MockSink {
            session_id: session_id.to_string(),
            recorded: Arc::clone(&self.recorded),
            results: Some(tx),
            frames: 0,
            bytes: 0,
            fail_after_frames: self.fail_after_frames,
            failing_sends: self.failing_sends,
            finish_delay: self.finish_delay,
        };

        let results = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok(BackendStream {
            sink: Box::new(sink),
            results,
        })
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn text_mode(&self) -> TextMode {
        TextMode::PerUtterance
    }
}

struct MockSink {
    session_id: String,
    recorded: Arc<Mutex<Recorded>>,
    results: Option<mpsc::UnboundedSender<Result<BackendResult>>>,
    frames: usize,
    bytes: usize,
    fail_after_frames: Option<usize>,
    failing_sends: usize,
    finish_delay: Duration,
}

impl MockSink {
    fn describe(&self) -> String {
        format!("heard {} bytes", self.bytes)
    }
}

#[async_trait::async_trait]
impl AudioSink for MockSink {
    async fn send_audio(&mut self, frame: &[u8]) -> Result<()> {
        if self.failing_sends > 0 {
            self.failing_sends -= 1;
            return Err(anyhow!("mock backend rejected frame"));
        }

        {
            let mut recorded = self.recorded.lock().unwrap_or_else(|e| e.into_inner());
            recorded
                .audio
                .entry(self.session_id.clone())
                .or_default()
                .extend_from_slice(frame);
            recorded
                .frames
                .entry(self.session_id.clone())
                .or_default()
                .push(frame.len());
        }
        self.frames += 1;
        self.bytes += frame.len();

        let Some(results) = &self.results else {
            return Err(anyhow!("mock stream already finished"));
        };

        if self.fail_after_frames == Some(self.frames) {
            let _ = results.send(Err(anyhow!("mock backend connection lost")));
            return Ok(());
        }

        let _ = results.send(Ok(BackendResult::partial(self.describe())));
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        {
            let mut recorded = self.recorded.lock().unwrap_or_else(|e| e.into_inner());
            recorded.finished.push(self.session_id.clone());
        }

        let text = self.describe();
        if let Some(results) = self.results.take() {
            let delay = self.finish_delay;
            // Dropping the sender after the final result ends the result stream.
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let _ = results.send(Ok(BackendResult::final_result(text)));
            });
        }
        Ok(())
    }
}
