//! NATS-connected streaming ASR service.
//!
//! Audio frames are published to `<audio_subject_prefix>.<session>` and
//! transcripts are consumed from `stt.text.>` (partial and final), filtered
//! by the `session_id` in the message payload.

mod backend;
pub mod messages;

pub use backend::NatsBackend;
pub use messages::{AudioFrameMessage, TranscriptMessage};
