//! Wire messages exchanged with clients.
//!
//! Every message is a JSON object with a `type` tag and camelCase fields:
//!
//! ```json
//! {"type": "audioChunk", "audioData": "AAEC...", "timestamp": 1700000000000, "soundLevel": -30.0}
//! {"type": "transcriptionResult", "resultId": "s1-0", "text": "hello", "isFinal": false, ...}
//! ```

use crate::audio::AudioChunkPayload;
use crate::error::{RelayError, RelayErrorKind};
use crate::transcription::TranscriptEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client → gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundMessage {
    StartRecording {
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
    },
    AudioChunk(AudioChunkPayload),
    StopTranscriptionStream {
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
    },
    StopRecording {
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
    },
}

/// Gateway → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    RecordingStarted(SessionStatus),
    /// Sent only after the backend stream is drained and closed.
    RecordingStopped(SessionStatus),
    TranscriptionResult(TranscriptEvent),
    TranscriptionError(TranscriptionError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionError {
    pub error: String,
    pub timestamp: DateTime<Utc>,
    /// The session's stream is gone and recording must be restarted
    #[serde(default)]
    pub fatal: bool,
}

impl OutboundMessage {
    pub fn started(session_id: &str) -> Self {
        OutboundMessage::RecordingStarted(SessionStatus {
            session_id: session_id.to_string(),
            status: "streaming".to_string(),
            message: format!("Transcription stream started for session {}", session_id),
        })
    }

    pub fn stopped(session_id: &str) -> Self {
        OutboundMessage::RecordingStopped(SessionStatus {
            session_id: session_id.to_string(),
            status: "stopped".to_string(),
            message: format!("Transcription stream stopped for session {}", session_id),
        })
    }

    pub fn error(err: &RelayError) -> Self {
        OutboundMessage::TranscriptionError(TranscriptionError {
            error: err.to_string(),
            timestamp: Utc::now(),
            fatal: err.kind() == RelayErrorKind::SessionFatal,
        })
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::RecordingStarted(_) => "recordingStarted",
            OutboundMessage::RecordingStopped(_) => "recordingStopped",
            OutboundMessage::TranscriptionResult(_) => "transcriptionResult",
            OutboundMessage::TranscriptionError(_) => "transcriptionError",
        }
    }

    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!("failed to serialize {} message: {}", self.kind(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_audio_chunk_message() {
        let json = r#"{"type": "audioChunk", "audioData": "AAA=", "timestamp": 12.5, "soundLevel": 0.3}"#;
        match serde_json::from_str::<InboundMessage>(json).unwrap() {
            InboundMessage::AudioChunk(payload) => {
                assert_eq!(payload.audio_data, "AAA=");
                assert_eq!(payload.timestamp, 12.5);
                assert_eq!(payload.sound_level, Some(0.3));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn stop_messages_tolerate_missing_session_id() {
        let stop: InboundMessage =
            serde_json::from_str(r#"{"type": "stopTranscriptionStream"}"#).unwrap();
        assert!(matches!(
            stop,
            InboundMessage::StopTranscriptionStream { session_id: None }
        ));

        let stop: InboundMessage =
            serde_json::from_str(r#"{"type": "stopRecording", "sessionId": "s1"}"#).unwrap();
        assert!(matches!(
            stop,
            InboundMessage::StopRecording { session_id: Some(ref id) } if id == "s1"
        ));
    }

    #[test]
    fn transcript_result_serializes_with_type_tag_and_camel_case() {
        let msg = OutboundMessage::TranscriptionResult(TranscriptEvent {
            result_id: "r1".to_string(),
            text: "roll the dice".to_string(),
            is_final: true,
            timestamp: Utc::now(),
            client_id: "c1".to_string(),
        });

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transcriptionResult");
        assert_eq!(json["resultId"], "r1");
        assert_eq!(json["isFinal"], true);
        assert_eq!(json["clientId"], "c1");
        assert!(json.get("result_id").is_none());
    }

    #[test]
    fn backend_errors_are_flagged_fatal() {
        let msg = OutboundMessage::error(&RelayError::backend("stream reset"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transcriptionError");
        assert_eq!(json["fatal"], true);

        let msg = OutboundMessage::error(&RelayError::InvalidAudio("bad".to_string()));
        assert_eq!(serde_json::to_value(&msg).unwrap()["fatal"], false);
    }
}
