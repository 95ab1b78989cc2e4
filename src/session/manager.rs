use super::config::SessionConfig;
use super::session::RelaySession;
use super::stats::SessionStats;
use super::SessionState;
use crate::audio::AudioChunk;
use crate::config::RelayConfig;
use crate::conversation::Utterance;
use crate::error::RelayError;
use crate::protocol::OutboundMessage;
use crate::router::EventRouter;
use crate::transcription::{AdapterExit, StreamAdapter, TranscriptionBackend};
use crate::vad::{self, VoiceActivityScorer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Voice-activity scorer plus the timeout applied to each call.
#[derive(Clone)]
pub struct VadHook {
    pub scorer: Arc<dyn VoiceActivityScorer>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new backend stream is being opened.
    Started,
    /// The session already streams; nothing was done.
    AlreadyActive,
}

#[derive(Debug, Clone)]
pub enum StopOutcome {
    /// Audio drained, backend stream closed, resources released.
    Stopped(SessionStats),
    /// No live session, or another caller already stopped it.
    NotActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushReport {
    /// This chunk lazily started the session
    pub started: bool,
    pub dropped_bytes: usize,
}

struct Inner {
    /// Live sessions (session_id → session)
    sessions: RwLock<HashMap<String, Arc<RelaySession>>>,
    backend: Arc<dyn TranscriptionBackend>,
    router: EventRouter,
    vad: Option<VadHook>,
    settings: RelayConfig,
}

/// Owns every live session and its lifecycle.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        backend: Arc<dyn TranscriptionBackend>,
        router: EventRouter,
        settings: RelayConfig,
        vad: Option<VadHook>,
    ) -> Self {
        info!(
            "Creating SessionManager with {} backend (frame={} bytes, buffer cap={} bytes)",
            backend.name(),
            settings.frame_bytes,
            settings.buffer_capacity_bytes
        );

        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                backend,
                router,
                vad,
                settings,
            }),
        }
    }

    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    pub fn settings(&self) -> &RelayConfig {
        &self.inner.settings
    }

    /// Start a session unless it is already streaming.
    pub async fn start(&self, session_id: &str, client_id: &str) -> StartOutcome {
        self.start_or_get(session_id, client_id).await.1
    }

    async fn start_or_get(&self, session_id: &str, client_id: &str) -> (Arc<RelaySession>, StartOutcome) {
        // Check and insert under one write lock so two racing starts open one stream.
        let mut sessions = self.inner.sessions.write().await;

        if let Some(existing) = sessions.get(session_id) {
            if existing.state() != SessionState::Inactive {
                if existing.client_id() != client_id {
                    warn!(
                        session_id = %session_id,
                        owner = %existing.client_id(),
                        client_id = %client_id,
                        "session already streaming for another client"
                    );
                }
                return (Arc::clone(existing), StartOutcome::AlreadyActive);
            }
        }

        let config = SessionConfig::new(session_id, client_id, &self.inner.settings);
        let session = Arc::new(RelaySession::new(config));

        let adapter = StreamAdapter {
            session_id: session_id.to_string(),
            client_id: client_id.to_string(),
            backend: Arc::clone(&self.inner.backend),
            buffer: Arc::clone(session.buffer()),
            frame_bytes: session.config().frame_bytes,
            counters: Arc::clone(session.counters()),
            transcript: Arc::clone(session.transcript()),
            router: self.inner.router.clone(),
        };
        let handle = tokio::spawn(drive(self.clone(), Arc::clone(&session), adapter));
        session.set_driver(handle).await;

        sessions.insert(session_id.to_string(), Arc::clone(&session));

        info!(session_id = %session_id, client_id = %client_id, "session started");
        (session, StartOutcome::Started)
    }

    /// Buffer one chunk, lazily starting the session on first use.
    pub async fn push_chunk(
        &self,
        session_id: &str,
        client_id: &str,
        chunk: AudioChunk,
    ) -> Result<PushReport, RelayError> {
        let (session, outcome) = self.start_or_get(session_id, client_id).await;
        if session.client_id() != client_id {
            return Err(RelayError::SessionOwned(session_id.to_string()));
        }
        let pushed = session.push(&chunk)?;
        debug!(
            session_id = %session_id,
            bytes = chunk.pcm.len(),
            duration_ms = chunk.duration_ms(self.inner.settings.sample_rate),
            dropped_bytes = pushed.dropped_bytes,
            "chunk queued"
        );

        if let Some(hook) = &self.inner.vad {
            vad::spawn_score(
                Arc::clone(&hook.scorer),
                hook.timeout,
                session_id.to_string(),
                chunk.pcm,
                chunk.sound_level,
                Arc::clone(session.counters()),
            );
        }

        Ok(PushReport {
            started: outcome == StartOutcome::Started,
            dropped_bytes: pushed.dropped_bytes,
        })
    }

    /// Two-phase stop: refuse new audio, then wait until everything queued
    /// has reached the backend and the backend has closed its stream.
    pub async fn stop(&self, session_id: &str) -> StopOutcome {
        let session = {
            let sessions = self.inner.sessions.read().await;
            sessions.get(session_id).cloned()
        };
        let Some(session) = session else {
            debug!(session_id = %session_id, "stop for unknown session ignored");
            return StopOutcome::NotActive;
        };

        let mut driver = session.driver().lock().await;
        // Torn down by a fatal error; its client already got that error.
        if session.state() == SessionState::Inactive {
            debug!(session_id = %session_id, "session already torn down");
            return StopOutcome::NotActive;
        }

        let Some(mut handle) = driver.take() else {
            debug!(session_id = %session_id, "session already stopped");
            return StopOutcome::NotActive;
        };

        if session.state() == SessionState::Streaming {
            session.transition(SessionState::Stopping);
        }
        session.buffer().close();
        info!(session_id = %session_id, queued_bytes = session.buffer().queued_bytes(), "stopping session, draining");

        let timeout = self.inner.settings.stop_timeout();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(session_id = %session_id, "stream task panicked: {}", e),
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "backend did not close in time, aborting stream"
                );
                handle.abort();
            }
        }

        let discarded = session.release();
        if discarded > 0 {
            warn!(session_id = %session_id, discarded, "discarded undelivered audio");
        }
        self.remove(session_id, session.generation()).await;

        info!(session_id = %session_id, "session stopped");
        StopOutcome::Stopped(session.stats())
    }

    /// Stop every session owned by a client (connection loss).
    pub async fn stop_client(&self, client_id: &str) -> usize {
        let owned: Vec<String> = {
            let sessions = self.inner.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.client_id() == client_id)
                .map(|s| s.session_id().to_string())
                .collect()
        };

        let mut stopped = 0;
        for session_id in owned {
            if let StopOutcome::Stopped(_) = self.stop(&session_id).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Stop everything (process shutdown).
    pub async fn stop_all(&self) {
        let ids = self.active_sessions().await;
        futures::future::join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    async fn remove(&self, session_id: &str, generation: Uuid) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get(session_id) {
            Some(current) if current.generation() == generation => {
                sessions.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<RelaySession>> {
        self.inner.sessions.read().await.get(session_id).cloned()
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.get(session_id).await.is_some()
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        let sessions = self.inner.sessions.read().await;
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn stats(&self, session_id: &str) -> Option<SessionStats> {
        self.get(session_id).await.map(|s| s.stats())
    }

    pub async fn transcript(&self, session_id: &str) -> Option<Vec<Utterance>> {
        self.get(session_id).await.map(|s| s.utterances())
    }
}

/// Runs the adapter for one session and tears the session down if its
/// backend stream dies.
async fn drive(manager: SessionManager, session: Arc<RelaySession>, adapter: StreamAdapter) {
    let router = adapter.router.clone();

    match adapter.run().await {
        AdapterExit::Completed => {
            debug!(session_id = %session.session_id(), "stream adapter completed");
        }
        AdapterExit::Failed(err) => {
            let discarded = session.release();
            error!(
                session_id = %session.session_id(),
                discarded,
                "session torn down after backend failure: {}",
                err
            );
            router
                .route(
                    session.session_id(),
                    session.client_id(),
                    OutboundMessage::error(&err),
                )
                .await;
            manager
                .remove(session.session_id(), session.generation())
                .await;
        }
    }
}
