//! Recording domain: identifiers, audio format, chunks and persisted parts

mod duration;
mod model;

pub use duration::Duration;
pub use model::{
    frame_size_for, session_sample_rate, AudioFormat, EncodedChunk, NewRecordingPart, Recording,
    RecordingId, RecordingMeta, RecordingPart, SessionId, FRAME_DURATION_MS, OPUS_SAMPLE_RATES,
};
