//! Audio output graph port

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

/// Output errors
#[derive(Debug, Clone, Error)]
pub enum OutputError {
    #[error("Output device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Output node is disconnected")]
    Disconnected,

    #[error("Playback failed: {0}")]
    Playback(String),
}

/// Decoded, playable audio
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    /// Interleaved samples
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmBuffer {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Length in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Control over one scheduled voice
pub trait VoiceControl: Send + Sync {
    /// Discard the voice if it has not started yet, otherwise cut it off
    fn stop(&self);

    fn has_started(&self) -> bool;
}

/// A decoded unit connected into the output graph, pending or active
pub struct ScheduledBuffer {
    /// Position of the part inside the recording, in seconds
    pub delta: f64,
    pub duration: f64,
    ended: Option<oneshot::Receiver<()>>,
    control: Arc<dyn VoiceControl>,
}

impl ScheduledBuffer {
    pub fn new(
        delta: f64,
        duration: f64,
        ended: oneshot::Receiver<()>,
        control: Arc<dyn VoiceControl>,
    ) -> Self {
        Self {
            delta,
            duration,
            ended: Some(ended),
            control,
        }
    }

    /// Resolves once the voice has finished (or was stopped or dropped).
    /// Cancel safe: dropping the future keeps the signal armed.
    pub async fn ended(&mut self) {
        if let Some(rx) = self.ended.as_mut() {
            let _ = rx.await;
            self.ended = None;
        }
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn has_started(&self) -> bool {
        self.control.has_started()
    }
}

impl std::fmt::Debug for ScheduledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledBuffer")
            .field("delta", &self.delta)
            .field("duration", &self.duration)
            .field("started", &self.control.has_started())
            .finish()
    }
}

/// Output node shared by every buffer of one playback session
pub trait OutputNode: Send + Sync {
    /// Schedule `buffer` to start at graph time `start_at` (seconds).
    /// `delta` is carried through to the returned handle.
    fn schedule(
        &self,
        buffer: PcmBuffer,
        start_at: f64,
        delta: f64,
    ) -> Result<ScheduledBuffer, OutputError>;

    /// Tear the node down; every voice still attached is stopped
    fn disconnect(&self);
}

/// Port for the audio output graph
#[async_trait]
pub trait OutputGraph: Send + Sync {
    /// Make sure the graph is running
    async fn resume(&self) -> Result<(), OutputError>;

    /// Current graph clock in seconds
    fn current_time(&self) -> f64;

    /// Connect a fresh output node
    fn connect(&self) -> Result<Box<dyn OutputNode>, OutputError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_duration_counts_frames() {
        let buffer = PcmBuffer {
            samples: vec![0.0; 9600],
            sample_rate: 48_000,
            channels: 2,
        };
        assert_eq!(buffer.frames(), 4800);
        assert!((buffer.duration() - 0.1).abs() < 1e-9);
    }
}
