pub mod audio;
pub mod config;
pub mod conversation;
pub mod error;
pub mod gateway;
pub mod http;
pub mod protocol;
pub mod router;
pub mod session;
pub mod transcription;
pub mod vad;

pub use audio::{AudioChunk, AudioChunkPayload, ChunkBuffer, FrameSplitter};
pub use config::Config;
pub use error::{RelayError, RelayErrorKind};
pub use http::{create_router, AppState};
pub use protocol::{InboundMessage, OutboundMessage};
pub use router::{ConnectionRegistry, EventRouter};
pub use session::{SessionManager, SessionState, SessionStats};
pub use transcription::{MockBackend, NatsBackend, TranscriptEvent, TranscriptionBackend};
