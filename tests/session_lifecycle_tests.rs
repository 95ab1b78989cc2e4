// Integration tests for the session lifecycle
//
// These tests drive the SessionManager against the in-process mock backend
// and observe what a connected client would receive.

use anyhow::{anyhow, Result};
use boardvoice_relay::audio::AudioChunk;
use boardvoice_relay::config::RelayConfig;
use boardvoice_relay::error::RelayError;
use boardvoice_relay::protocol::OutboundMessage;
use boardvoice_relay::session::{SessionManager, SessionState, StartOutcome, StopOutcome, VadHook};
use boardvoice_relay::transcription::{AudioSink, BackendStream, TranscriptionBackend};
use boardvoice_relay::vad::VoiceActivityScorer;
use boardvoice_relay::{ConnectionRegistry, EventRouter, MockBackend};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn manager_with(backend: &MockBackend, settings: RelayConfig, vad: Option<VadHook>) -> SessionManager {
    let router = EventRouter::new(ConnectionRegistry::new(), 256);
    SessionManager::new(Arc::new(backend.clone()), router, settings, vad)
}

async fn connect(manager: &SessionManager, client_id: &str) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(1024);
    manager
        .router()
        .registry()
        .register(client_id.to_string(), tx)
        .await;
    rx
}

fn drain(rx: &mut mpsc::Receiver<String>) -> Result<Vec<OutboundMessage>> {
    let mut messages = Vec::new();
    while let Ok(json) = rx.try_recv() {
        messages.push(serde_json::from_str(&json)?);
    }
    Ok(messages)
}

fn pcm(len: usize, fill: u8) -> AudioChunk {
    AudioChunk {
        pcm: vec![fill; len],
        timestamp: 0.0,
        sound_level: None,
    }
}

async fn wait_until<F, Fut>(mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("condition not reached in time"))
}

#[tokio::test]
async fn test_three_chunks_reach_backend_in_order() -> Result<()> {
    let backend = MockBackend::new();
    let manager = manager_with(&backend, RelayConfig::default(), None);
    let mut rx = connect(&manager, "client-1").await;

    let mut expected = Vec::new();
    for fill in 1..=3u8 {
        let chunk = pcm(2000, fill);
        expected.extend_from_slice(&chunk.pcm);
        let report = manager.push_chunk("s1", "client-1", chunk).await?;
        assert_eq!(report.started, fill == 1, "Only the first chunk starts the session");
    }

    let StopOutcome::Stopped(stats) = manager.stop("s1").await else {
        panic!("Expected the session to stop");
    };

    // Every byte forwarded in order, cut into 1024-byte frames plus a remainder
    assert_eq!(backend.received_audio("s1"), expected);
    assert_eq!(backend.frame_sizes("s1"), vec![1024, 1024, 1024, 1024, 1024, 880]);
    assert!(backend.finished("s1"));
    assert_eq!(stats.chunks_received, 3);
    assert_eq!(stats.bytes_received, 6000);
    assert_eq!(stats.bytes_sent, 6000);

    assert!(manager.active_sessions().await.is_empty());

    let messages = drain(&mut rx)?;
    assert!(matches!(messages.first(), Some(OutboundMessage::RecordingStarted(s)) if s.session_id == "s1"));
    match messages.last() {
        Some(OutboundMessage::TranscriptionResult(event)) => {
            assert!(event.is_final);
            assert_eq!(event.text, "heard 6000 bytes");
            assert_eq!(event.client_id, "client-1");
        }
        other => panic!("Expected a final transcription result, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn test_partials_carry_full_text_so_far() -> Result<()> {
    let backend = MockBackend::new();
    let manager = manager_with(&backend, RelayConfig::default(), None);
    let mut rx = connect(&manager, "client-1").await;

    manager.push_chunk("s1", "client-1", pcm(2048, 0)).await?;
    manager.stop("s1").await;

    let results: Vec<_> = drain(&mut rx)?
        .into_iter()
        .filter_map(|m| match m {
            OutboundMessage::TranscriptionResult(event) => Some(event),
            _ => None,
        })
        .collect();

    let texts: Vec<&str> = results.iter().map(|e| e.text.as_str()).collect();
    assert_eq!(texts, vec!["heard 1024 bytes", "heard 2048 bytes", "heard 2048 bytes"]);
    assert!(results.iter().all(|e| e.result_id == "s1-0"));
    assert_eq!(results.iter().filter(|e| e.is_final).count(), 1);

    let transcript = manager.transcript("s1").await;
    assert!(transcript.is_none(), "Stopped sessions are removed");

    Ok(())
}

#[tokio::test]
async fn test_concurrent_first_chunks_open_one_stream() -> Result<()> {
    let backend = MockBackend::new();
    let manager = manager_with(&backend, RelayConfig::default(), None);

    let pushes = (0..10).map(|i| {
        let manager = manager.clone();
        async move { manager.push_chunk("s1", "client-1", pcm(64, i)).await }
    });
    let reports = futures::future::join_all(pushes).await;

    let started = reports
        .into_iter()
        .collect::<Result<Vec<_>, RelayError>>()?
        .into_iter()
        .filter(|r| r.started)
        .count();
    assert_eq!(started, 1);

    manager.stop("s1").await;
    assert_eq!(backend.streams_opened(), 1);
    assert_eq!(backend.received_audio("s1").len(), 640);

    Ok(())
}

#[tokio::test]
async fn test_start_is_idempotent() -> Result<()> {
    let backend = MockBackend::new();
    let manager = manager_with(&backend, RelayConfig::default(), None);

    assert_eq!(manager.start("s1", "client-1").await, StartOutcome::Started);
    assert_eq!(manager.start("s1", "client-1").await, StartOutcome::AlreadyActive);

    manager.stop("s1").await;
    assert_eq!(backend.streams_opened(), 1);

    Ok(())
}

#[tokio::test]
async fn test_stop_waits_for_trailing_results() -> Result<()> {
    let backend = MockBackend::new().with_finish_delay(Duration::from_millis(200));
    let manager = manager_with(&backend, RelayConfig::default(), None);
    let mut rx = connect(&manager, "client-1").await;

    manager.push_chunk("s1", "client-1", pcm(1024, 7)).await?;
    let outcome = manager.stop("s1").await;
    assert!(matches!(outcome, StopOutcome::Stopped(_)));

    // The final result was already delivered when stop returned.
    let messages = drain(&mut rx)?;
    assert!(messages
        .iter()
        .any(|m| matches!(m, OutboundMessage::TranscriptionResult(e) if e.is_final)));

    Ok(())
}

#[tokio::test]
async fn test_stop_is_idempotent() -> Result<()> {
    let backend = MockBackend::new().with_finish_delay(Duration::from_millis(100));
    let manager = manager_with(&backend, RelayConfig::default(), None);

    // Stop before anything started is a no-op.
    assert!(matches!(manager.stop("s1").await, StopOutcome::NotActive));

    manager.push_chunk("s1", "client-1", pcm(512, 1)).await?;
    let (first, second) = tokio::join!(manager.stop("s1"), manager.stop("s1"));

    let stopped = [&first, &second]
        .iter()
        .filter(|o| matches!(o, StopOutcome::Stopped(_)))
        .count();
    assert_eq!(stopped, 1, "Exactly one stop performs the teardown");
    assert!(matches!(manager.stop("s1").await, StopOutcome::NotActive));

    Ok(())
}

#[tokio::test]
async fn test_chunks_rejected_while_stopping() -> Result<()> {
    let backend = MockBackend::new().with_finish_delay(Duration::from_millis(300));
    let manager = manager_with(&backend, RelayConfig::default(), None);

    manager.push_chunk("s1", "client-1", pcm(512, 1)).await?;

    let stopper = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.stop("s1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = manager
        .push_chunk("s1", "client-1", pcm(512, 2))
        .await
        .expect_err("Chunk during stop must be rejected");
    assert!(matches!(err, RelayError::SessionStopping(_)));

    assert!(matches!(stopper.await?, StopOutcome::Stopped(_)));
    assert_eq!(backend.received_audio("s1").len(), 512);

    Ok(())
}

#[tokio::test]
async fn test_stop_timeout_aborts_hung_backend() -> Result<()> {
    let backend = MockBackend::new().with_finish_delay(Duration::from_secs(30));
    let settings = RelayConfig {
        stop_timeout_ms: 100,
        ..RelayConfig::default()
    };
    let manager = manager_with(&backend, settings, None);

    manager.push_chunk("s1", "client-1", pcm(256, 1)).await?;

    let outcome = tokio::time::timeout(Duration::from_secs(5), manager.stop("s1")).await?;
    assert!(matches!(outcome, StopOutcome::Stopped(_)));
    assert!(!manager.is_active("s1").await);

    Ok(())
}

#[tokio::test]
async fn test_backend_failure_tears_session_down() -> Result<()> {
    let backend = MockBackend::new().failing_after(2);
    let manager = manager_with(&backend, RelayConfig::default(), None);
    let mut rx = connect(&manager, "client-1").await;

    manager.push_chunk("s1", "client-1", pcm(4096, 1)).await?;

    let fatal = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(json) = rx.recv().await {
            if let Ok(OutboundMessage::TranscriptionError(e)) = serde_json::from_str(&json) {
                return Some(e);
            }
        }
        None
    })
    .await?
    .ok_or_else(|| anyhow!("connection closed before error"))?;
    assert!(fatal.fatal);

    let check = manager.clone();
    wait_until(|| {
        let manager = check.clone();
        async move { !manager.is_active("s1").await }
    })
    .await?;

    // The next chunk starts a fresh stream.
    let report = manager.push_chunk("s1", "client-1", pcm(512, 2)).await?;
    assert!(report.started);
    assert_eq!(backend.streams_opened(), 2);

    Ok(())
}

#[tokio::test]
async fn test_refused_stream_reports_fatal_error() -> Result<()> {
    let backend = MockBackend::new().refusing_streams();
    let manager = manager_with(&backend, RelayConfig::default(), None);
    let mut rx = connect(&manager, "client-1").await;

    manager.push_chunk("s1", "client-1", pcm(512, 1)).await?;

    let json = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .ok_or_else(|| anyhow!("no message"))?;
    match serde_json::from_str::<OutboundMessage>(&json)? {
        OutboundMessage::TranscriptionError(e) => assert!(e.fatal),
        other => panic!("Expected transcriptionError, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn test_sessions_are_isolated() -> Result<()> {
    let backend = MockBackend::new();
    let manager = manager_with(&backend, RelayConfig::default(), None);
    let mut rx_a = connect(&manager, "client-a").await;
    let mut rx_b = connect(&manager, "client-b").await;

    manager.push_chunk("a", "client-a", pcm(1024, 0xA)).await?;
    manager.push_chunk("b", "client-b", pcm(2048, 0xB)).await?;

    assert_eq!(manager.active_sessions().await, vec!["a".to_string(), "b".to_string()]);

    // Another client may not feed a session it does not own.
    let err = manager
        .push_chunk("a", "client-b", pcm(16, 0))
        .await
        .expect_err("Foreign chunk must be rejected");
    assert!(matches!(err, RelayError::SessionOwned(_)));

    manager.stop_all().await;

    assert!(backend.received_audio("a").iter().all(|b| *b == 0xA));
    assert!(backend.received_audio("b").iter().all(|b| *b == 0xB));
    assert_eq!(backend.received_audio("a").len(), 1024);

    for (rx, session_id) in [(&mut rx_a, "a"), (&mut rx_b, "b")] {
        for message in drain(rx)? {
            if let OutboundMessage::RecordingStarted(status) = &message {
                assert_eq!(status.session_id, session_id);
            }
        }
    }

    Ok(())
}

#[tokio::test]
async fn test_client_loss_stops_owned_sessions() -> Result<()> {
    let backend = MockBackend::new();
    let manager = manager_with(&backend, RelayConfig::default(), None);

    manager.push_chunk("a1", "client-a", pcm(128, 1)).await?;
    manager.push_chunk("a2", "client-a", pcm(128, 1)).await?;
    manager.push_chunk("b1", "client-b", pcm(128, 1)).await?;

    assert_eq!(manager.stop_client("client-a").await, 2);
    assert_eq!(manager.active_sessions().await, vec!["b1".to_string()]);

    manager.stop_all().await;
    Ok(())
}

struct Hanging;

#[async_trait::async_trait]
impl VoiceActivityScorer for Hanging {
    async fn score(&self, _: &str, _: &[u8], _: Option<f64>) -> Result<bool> {
        std::future::pending::<Result<bool>>().await
    }

    fn name(&self) -> &str {
        "hanging"
    }
}

struct AlwaysSpeech;

#[async_trait::async_trait]
impl VoiceActivityScorer for AlwaysSpeech {
    async fn score(&self, _: &str, _: &[u8], _: Option<f64>) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "always"
    }
}

#[tokio::test]
async fn test_hanging_vad_does_not_block_transcription() -> Result<()> {
    let backend = MockBackend::new();
    let vad = VadHook {
        scorer: Arc::new(Hanging),
        timeout: Duration::from_secs(60),
    };
    let manager = manager_with(&backend, RelayConfig::default(), Some(vad));

    for fill in 0..3 {
        manager.push_chunk("s1", "client-1", pcm(1024, fill)).await?;
    }

    let outcome = tokio::time::timeout(Duration::from_secs(5), manager.stop("s1")).await?;
    let StopOutcome::Stopped(stats) = outcome else {
        panic!("Expected the session to stop");
    };
    assert_eq!(stats.bytes_sent, 3072);
    assert_eq!(stats.speech_chunks, 0);

    Ok(())
}

#[tokio::test]
async fn test_vad_scores_are_counted() -> Result<()> {
    let backend = MockBackend::new();
    let vad = VadHook {
        scorer: Arc::new(AlwaysSpeech),
        timeout: Duration::from_secs(1),
    };
    let manager = manager_with(&backend, RelayConfig::default(), Some(vad));

    manager.push_chunk("s1", "client-1", pcm(256, 1)).await?;
    manager.push_chunk("s1", "client-1", pcm(256, 2)).await?;

    let check = manager.clone();
    wait_until(|| {
        let manager = check.clone();
        async move {
            manager
                .stats("s1")
                .await
                .map(|s| s.speech_chunks == 2)
                .unwrap_or(false)
        }
    })
    .await?;

    manager.stop("s1").await;
    Ok(())
}

#[tokio::test]
async fn test_two_send_failures_are_transient() -> Result<()> {
    let backend = MockBackend::new().failing_sends(2);
    let manager = manager_with(&backend, RelayConfig::default(), None);
    let mut rx = connect(&manager, "client-1").await;

    manager.push_chunk("s1", "client-1", pcm(4096, 1)).await?;

    let recorded = backend.clone();
    wait_until(|| {
        let backend = recorded.clone();
        async move { backend.received_audio("s1").len() == 2048 }
    })
    .await?;

    let errors: Vec<_> = drain(&mut rx)?
        .into_iter()
        .filter_map(|m| match m {
            OutboundMessage::TranscriptionError(e) => Some(e),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| !e.fatal));
    assert!(manager.is_active("s1").await);

    // Frames after the failures keep flowing.
    manager.push_chunk("s1", "client-1", pcm(1024, 2)).await?;
    let StopOutcome::Stopped(stats) = manager.stop("s1").await else {
        panic!("Expected the session to stop");
    };
    assert_eq!(stats.bytes_sent, 3072);
    assert_eq!(backend.received_audio("s1").len(), 3072);

    Ok(())
}

#[tokio::test]
async fn test_third_consecutive_send_failure_is_fatal() -> Result<()> {
    let backend = MockBackend::new().failing_sends(3);
    let manager = manager_with(&backend, RelayConfig::default(), None);
    let mut rx = connect(&manager, "client-1").await;

    manager.push_chunk("s1", "client-1", pcm(4096, 1)).await?;

    let mut fatal_flags = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(json) = rx.recv().await {
            if let Ok(OutboundMessage::TranscriptionError(e)) = serde_json::from_str(&json) {
                fatal_flags.push(e.fatal);
                if e.fatal {
                    break;
                }
            }
        }
    })
    .await?;
    assert_eq!(fatal_flags, vec![false, false, true]);

    let check = manager.clone();
    wait_until(|| {
        let manager = check.clone();
        async move { !manager.is_active("s1").await }
    })
    .await?;
    assert!(backend.received_audio("s1").is_empty());

    Ok(())
}

#[tokio::test]
async fn test_stop_after_fatal_teardown_is_not_active() -> Result<()> {
    let backend = MockBackend::new().refusing_streams();
    let manager = manager_with(&backend, RelayConfig::default(), None);

    // A full outbound queue holds the teardown between release and removal.
    let (tx, mut rx) = mpsc::channel(1);
    manager
        .router()
        .registry()
        .register("client-1".to_string(), tx.clone())
        .await;
    tx.send("queued".to_string()).await?;

    assert_eq!(manager.start("s1", "client-1").await, StartOutcome::Started);

    let check = manager.clone();
    wait_until(|| {
        let manager = check.clone();
        async move {
            manager
                .get("s1")
                .await
                .map(|s| s.state() == SessionState::Inactive)
                .unwrap_or(false)
        }
    })
    .await?;

    assert!(matches!(manager.stop("s1").await, StopOutcome::NotActive));

    // Let the teardown deliver its error and finish.
    assert_eq!(rx.recv().await.as_deref(), Some("queued"));
    let json = rx.recv().await.ok_or_else(|| anyhow!("no error delivered"))?;
    assert!(matches!(
        serde_json::from_str::<OutboundMessage>(&json)?,
        OutboundMessage::TranscriptionError(e) if e.fatal
    ));

    Ok(())
}

/// Backend whose sink never completes a send; records when the sink is dropped.
struct StalledBackend {
    released: Arc<AtomicBool>,
}

struct StalledSink {
    released: Arc<AtomicBool>,
}

impl Drop for StalledSink {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl AudioSink for StalledSink {
    async fn send_audio(&mut self, _frame: &[u8]) -> Result<()> {
        std::future::pending::<Result<()>>().await
    }

    async fn finish(&mut self) -> Result<()> {
        std::future::pending::<Result<()>>().await
    }
}

#[async_trait::async_trait]
impl TranscriptionBackend for StalledBackend {
    async fn open_stream(&self, _session_id: &str) -> Result<BackendStream> {
        Ok(BackendStream {
            sink: Box::new(StalledSink {
                released: Arc::clone(&self.released),
            }),
            results: futures::stream::pending().boxed(),
        })
    }

    fn name(&self) -> &str {
        "stalled"
    }
}

#[tokio::test]
async fn test_stop_timeout_releases_backend_sink() -> Result<()> {
    let released = Arc::new(AtomicBool::new(false));
    let backend = StalledBackend {
        released: Arc::clone(&released),
    };
    let settings = RelayConfig {
        stop_timeout_ms: 100,
        ..RelayConfig::default()
    };
    let router = EventRouter::new(ConnectionRegistry::new(), 64);
    let manager = SessionManager::new(Arc::new(backend), router, settings, None);

    manager.push_chunk("s1", "client-1", pcm(2048, 1)).await?;

    let outcome = tokio::time::timeout(Duration::from_secs(5), manager.stop("s1")).await?;
    assert!(matches!(outcome, StopOutcome::Stopped(_)));
    assert!(!manager.is_active("s1").await);

    let flag = Arc::clone(&released);
    wait_until(|| {
        let flag = Arc::clone(&flag);
        async move { flag.load(Ordering::SeqCst) }
    })
    .await?;

    Ok(())
}
