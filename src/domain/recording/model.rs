//! Recording model shared by capture, storage and playback

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::InvalidRecordingIdError;

/// Time span encoded by a single codec call
pub const FRAME_DURATION_MS: u32 = 100;

/// Sample rates the Opus codec accepts
pub const OPUS_SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

/// Rate used when the capture device runs at a rate Opus cannot encode
const FALLBACK_SAMPLE_RATE: u32 = 48_000;

/// Codec-side handle for an encoder or decoder session
pub type SessionId = u32;

/// Number of samples per channel in one frame of `frame_ms` at `sample_rate`.
pub const fn frame_size_for(sample_rate: u32, frame_ms: u32) -> usize {
    (sample_rate as usize * frame_ms as usize) / 1000
}

/// Pick the encoding rate for a device: its own rate when Opus supports it,
/// otherwise 48 kHz (the capture graph resamples).
pub fn session_sample_rate(device_rate: u32) -> u32 {
    if OPUS_SAMPLE_RATES.contains(&device_rate) {
        device_rate
    } else {
        FALLBACK_SAMPLE_RATE
    }
}

/// Unique identifier of a persisted recording
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordingId(String);

impl RecordingId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordingId {
    type Err = InvalidRecordingIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(|parsed| Self(parsed.to_string()))
            .map_err(|_| InvalidRecordingIdError {
                input: s.to_string(),
            })
    }
}

/// Audio layout of an encoded stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one codec frame
    pub frame_size: usize,
}

impl AudioFormat {
    /// Mono format with the standard 100 ms frame
    pub const fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            frame_size: frame_size_for(sample_rate, FRAME_DURATION_MS),
        }
    }

    /// Duration in seconds of `sample_count` samples per channel
    pub fn seconds_for(&self, sample_count: u32) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        sample_count as f64 / self.sample_rate as f64
    }

    /// Duration in milliseconds of `sample_count` samples per channel
    pub fn millis_for(&self, sample_count: u32) -> f64 {
        self.seconds_for(sample_count) * 1000.0
    }
}

/// One compressed unit produced by the encode pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    pub encoder_id: SessionId,
    /// Strictly increasing within a recording session, starting at 0
    pub sequence_index: u64,
    pub sample_count: u32,
    pub payload: Vec<u8>,
    pub duration_ms: f64,
}

impl EncodedChunk {
    /// The part write this chunk maps to
    pub fn into_part(self, format: AudioFormat) -> NewRecordingPart {
        NewRecordingPart {
            encoder_id: self.encoder_id,
            part_index: self.sequence_index,
            sample_count: self.sample_count,
            format,
            encoded: self.payload,
        }
    }
}

/// Metadata supplied when a recording is created
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingMeta {
    pub encoder_id: SessionId,
    pub format: AudioFormat,
    pub device: Option<String>,
}

/// Part insert request, addressed by encoder id
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecordingPart {
    pub encoder_id: SessionId,
    pub part_index: u64,
    pub sample_count: u32,
    pub format: AudioFormat,
    pub encoded: Vec<u8>,
}

/// A persisted compressed part
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingPart {
    pub recording_id: RecordingId,
    pub part_index: u64,
    pub encoded: Vec<u8>,
    pub sample_count: u32,
    pub format: AudioFormat,
}

impl RecordingPart {
    pub fn duration_secs(&self) -> f64 {
        self.format.seconds_for(self.sample_count)
    }
}

/// Persisted recording aggregate, updated alongside every part insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: RecordingId,
    pub encoder_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    #[serde(default)]
    pub device: Option<String>,
    /// Total encoded bytes
    pub size: u64,
    pub duration_ms: f64,
    pub part_count: u64,
}

impl Recording {
    /// Fresh, empty aggregate for `meta`
    pub fn new(id: RecordingId, meta: &RecordingMeta) -> Self {
        Self {
            id,
            encoder_id: meta.encoder_id,
            created_at: Utc::now(),
            sample_rate: meta.format.sample_rate,
            channels: meta.format.channels,
            frame_size: meta.format.frame_size,
            device: meta.device.clone(),
            size: 0,
            duration_ms: 0.0,
            part_count: 0,
        }
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            frame_size: self.frame_size,
        }
    }

    /// Fold a newly inserted part into the aggregate
    pub fn absorb(&mut self, part: &NewRecordingPart) {
        self.size += part.encoded.len() as u64;
        self.duration_ms += part.format.millis_for(part.sample_count);
        self.part_count += 1;
    }

    /// Human-readable size string
    pub fn human_readable_size(&self) -> String {
        let bytes = self.size as f64;
        if bytes < 1024.0 {
            format!("{} B", self.size)
        } else if bytes < 1024.0 * 1024.0 {
            format!("{:.1} KB", bytes / 1024.0)
        } else {
            format!("{:.2} MB", bytes / (1024.0 * 1024.0))
        }
    }
}
