//! Recorder phases and the read-only status snapshot

use std::fmt;

use crate::domain::recording::{AudioFormat, RecordingId, SessionId};

/// Lifecycle phase of the capture state machine.
///
/// State machine:
///   IDLE -> STARTING_TO_RECORD (start)
///   STARTING_TO_RECORD -> RECORDING (all resources acquired)
///   STARTING_TO_RECORD -> IDLE (step failure or stop, after rollback)
///   RECORDING -> IDLE (stop, after the drain barrier)
///
/// `StoppingToRecord` is a declared phase that no transition enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RecorderPhase {
    #[default]
    Idle,
    StartingToRecord,
    Recording,
    StoppingToRecord,
}

impl RecorderPhase {
    /// Get the string representation
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::StartingToRecord => "starting",
            Self::Recording => "recording",
            Self::StoppingToRecord => "stopping",
        }
    }
}

impl fmt::Display for RecorderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Read-only view of the recorder, safe to hand to presentation code
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecorderStatus {
    pub phase: RecorderPhase,
    pub encoder_id: Option<SessionId>,
    pub recording_id: Option<RecordingId>,
    pub device: Option<String>,
    pub format: Option<AudioFormat>,
    /// Samples per channel encoded so far in this session
    pub sample_count: u64,
    /// Peak level of the last analysed block, 0.0..=1.0
    pub level: f32,
    /// Set once the encode pipeline stopped emitting chunks after a failure
    pub encode_halted: bool,
}

impl RecorderStatus {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.phase == RecorderPhase::Recording
    }

    /// Elapsed encoded time in milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        match self.format {
            Some(format) if format.sample_rate > 0 => {
                self.sample_count * 1000 / format.sample_rate as u64
            }
            _ => 0,
        }
    }
}
