//! Domain layer - Core business logic
//!
//! Contains value objects, the recording model, state snapshots and the
//! pure arithmetic used by the playback scheduler.
//! This layer has no dependencies on external systems.

pub mod capture;
pub mod config;
pub mod error;
pub mod playback;
pub mod recording;

// Re-export common types
pub use capture::{RecorderPhase, RecorderStatus};
pub use config::AppConfig;
pub use error::*;
pub use playback::{PlaybackState, WindowCursor};
pub use recording::{
    AudioFormat, Duration, EncodedChunk, NewRecordingPart, Recording, RecordingId, RecordingMeta,
    RecordingPart, SessionId,
};
