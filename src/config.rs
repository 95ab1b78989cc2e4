use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub backend: BackendConfig,
    pub vad: VadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "boardvoice-relay".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. "info" or "boardvoice_relay=debug"
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// What the chunk buffer does when a session's consumer falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new chunk and report it to the client.
    Reject,
    /// Evict queued chunks from the front until the new one fits.
    DropOldest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upper bound on queued audio per session
    pub buffer_capacity_bytes: usize,
    pub overflow: OverflowPolicy,
    /// Frame size the backend expects
    pub frame_bytes: usize,
    /// PCM sample rate (16-bit mono)
    pub sample_rate: u32,
    /// How long stop waits for drain-and-close before aborting the backend stream
    pub stop_timeout_ms: u64,
    /// How long the chunk mutation waits for a fragment produced by that chunk
    pub chunk_response_wait_ms: u64,
    /// Outbound message queue per WebSocket connection
    pub outbound_queue: usize,
    /// Broadcast capacity of the event feed
    pub event_feed_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_capacity_bytes: 1024 * 1024,
            overflow: OverflowPolicy::Reject,
            frame_bytes: 1024,
            sample_rate: 16000,
            stop_timeout_ms: 10_000,
            chunk_response_wait_ms: 250,
            outbound_queue: 256,
            event_feed_capacity: 1024,
        }
    }
}

impl RelayConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn chunk_response_wait(&self) -> Duration {
        Duration::from_millis(self.chunk_response_wait_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Mock,
    Nats,
}

/// How the backend reports text for a partial result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMode {
    /// Each result carries the text-so-far of its own utterance.
    PerUtterance,
    /// Each result carries everything recognized since the stream opened.
    SessionCumulative,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub nats_url: String,
    pub audio_subject_prefix: String,
    pub transcript_subject: String,
    pub text_mode: TextMode,
    /// After the final frame, how long to wait for trailing transcripts
    pub drain_grace_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Mock,
            nats_url: "nats://localhost:4222".to_string(),
            audio_subject_prefix: "audio.frame".to_string(),
            transcript_subject: "stt.text.>".to_string(),
            text_mode: TextMode::PerUtterance,
            drain_grace_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub enabled: bool,
    pub subject: String,
    pub timeout_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            subject: "vad.score".to_string(),
            timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Load from an optional file (any extension `config` understands) and
    /// `BOARDVOICE__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("BOARDVOICE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
