use crate::error::RelayError;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// `audioChunk` payload as it arrives on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunkPayload {
    /// Base64-encoded 16-bit PCM
    pub audio_data: String,
    /// Client capture time (milliseconds since epoch)
    #[serde(default)]
    pub timestamp: f64,
    /// Client-side amplitude hint
    #[serde(default)]
    pub sound_level: Option<f64>,
}

/// A decoded audio chunk ready for buffering.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub pcm: Vec<u8>,
    pub timestamp: f64,
    pub sound_level: Option<f64>,
}

impl AudioChunk {
    /// Raw PCM received outside the JSON envelope (binary WebSocket frame).
    pub fn from_raw(pcm: Vec<u8>) -> Result<Self, RelayError> {
        validate_pcm(&pcm)?;
        Ok(Self {
            pcm,
            timestamp: chrono::Utc::now().timestamp_millis() as f64,
            sound_level: None,
        })
    }

    /// Duration of the chunk in milliseconds at the given sample rate.
    pub fn duration_ms(&self, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        (self.pcm.len() / 2) as f64 * 1000.0 / sample_rate as f64
    }
}

impl TryFrom<AudioChunkPayload> for AudioChunk {
    type Error = RelayError;

    fn try_from(payload: AudioChunkPayload) -> Result<Self, Self::Error> {
        let pcm = base64::engine::general_purpose::STANDARD
            .decode(payload.audio_data.trim())
            .map_err(|e| RelayError::InvalidAudio(format!("bad base64: {}", e)))?;
        validate_pcm(&pcm)?;

        Ok(Self {
            pcm,
            timestamp: payload.timestamp,
            sound_level: payload.sound_level,
        })
    }
}

fn validate_pcm(pcm: &[u8]) -> Result<(), RelayError> {
    if pcm.is_empty() {
        return Err(RelayError::InvalidAudio("empty audio chunk".to_string()));
    }
    if pcm.len() % 2 != 0 {
        return Err(RelayError::InvalidAudio(format!(
            "odd byte length {} for 16-bit PCM",
            pcm.len()
        )));
    }
    Ok(())
}
