pub mod buffer;
pub mod chunk;
pub mod frames;

pub use buffer::{ChunkBuffer, Drain, PushOutcome};
pub use chunk::{AudioChunk, AudioChunkPayload};
pub use frames::FrameSplitter;
