use serde::{Deserialize, Serialize};

/// Audio frame message published to NATS
#[derive(Debug, Serialize, Deserialize)]
pub struct AudioFrameMessage {
    pub session_id: String,
    pub sequence: u32,
    pub pcm: String, // Base64-encoded PCM bytes
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp: String, // RFC3339 timestamp
    #[serde(rename = "final")]
    pub final_frame: bool,
}

/// Transcript message received from STT service
#[derive(Debug, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub session_id: String,
    pub text: String,
    pub partial: bool,
    pub timestamp: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    /// Utterance id, when the STT service tracks one
    #[serde(default)]
    pub segment_id: Option<String>,
    /// Set on the last message for a session after its final frame
    #[serde(default)]
    pub end_of_stream: bool,
}

/// Request body for the voice-activity scoring subject
#[derive(Debug, Serialize, Deserialize)]
pub struct VadRequest {
    pub session_id: String,
    pub pcm: String, // Base64-encoded PCM bytes
    pub sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_level: Option<f64>,
}

/// Reply from the voice-activity scoring subject
#[derive(Debug, Serialize, Deserialize)]
pub struct VadResponse {
    pub speech: bool,
    #[serde(default)]
    pub score: Option<f32>,
}
