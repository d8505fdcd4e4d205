//! Application layer - Use cases and port interfaces
//!
//! Contains the capture state machine, the encode pipeline, the playback
//! scheduler and the trait definitions for external system interactions.

pub mod capture;
pub mod capture_graph;
pub mod encode_pipeline;
pub mod events;
pub mod playback;
pub mod ports;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export use cases
pub use capture::{CaptureConfig, CaptureError, CaptureStateMachine, StartedRecording};
pub use encode_pipeline::{EncodePipeline, EncodeSession, PipelineReport};
pub use events::{Event, EventBus, EventKind, Subscription};
pub use playback::{
    DecoderLease, PlayOutcome, PlaybackConfig, PlaybackError, PlaybackProgress, PlaybackScheduler,
};
