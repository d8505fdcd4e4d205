//! Codec service port
//!
//! The codec runs behind an opaque request/response boundary. Every failure
//! is reported as a non-empty list of diagnostic strings; there is no
//! partial success.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::recording::SessionId;

/// Codec request failure carrying diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Codec request failed: {}", .0.join("; "))]
pub struct CodecFailure(Vec<String>);

impl CodecFailure {
    /// Failure with a single diagnostic
    pub fn new(message: impl Into<String>) -> Self {
        Self(vec![message.into()])
    }

    /// Failure from a diagnostic list; an empty list gets a generic entry
    pub fn from_diagnostics(diagnostics: Vec<String>) -> Self {
        if diagnostics.is_empty() {
            Self::new("unspecified codec failure")
        } else {
            Self(diagnostics)
        }
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.0
    }

    pub fn into_diagnostics(self) -> Vec<String> {
        self.0
    }
}

/// Encoder session parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderOptions {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one frame
    pub frame_size: usize,
    /// Output budget per encoded frame, in bytes
    pub max_output_bytes: usize,
}

/// Decoder session parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderOptions {
    pub sample_rate: u32,
    pub channels: u16,
}

/// One encoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPacket {
    pub payload: Vec<u8>,
    /// Samples per channel covered by the packet
    pub sample_count: u32,
    pub duration_ms: f64,
}

/// Port for the encoder/decoder service
#[async_trait]
pub trait CodecService: Send + Sync {
    /// Create an encoder session
    async fn create_encoder(&self, options: EncoderOptions) -> Result<SessionId, CodecFailure>;

    /// Feed interleaved PCM into an encoder session.
    ///
    /// # Returns
    /// `None` when fewer than one frame of samples is buffered (not an error)
    async fn encode_float(
        &self,
        id: SessionId,
        pcm: Vec<f32>,
        max_bytes: usize,
    ) -> Result<Option<EncodedPacket>, CodecFailure>;

    /// Set the encoder bitrate; returns the value now in effect
    async fn set_bitrate(&self, id: SessionId, bits_per_second: i32) -> Result<i32, CodecFailure>;

    /// Read the encoder bitrate
    async fn get_bitrate(&self, id: SessionId) -> Result<i32, CodecFailure>;

    /// Create a decoder session
    async fn create_decoder(&self, options: DecoderOptions) -> Result<SessionId, CodecFailure>;

    /// Decode one packet into interleaved PCM
    async fn decode_float(&self, id: SessionId, payload: Vec<u8>)
        -> Result<Vec<f32>, CodecFailure>;

    /// Release a session. Unknown ids are acknowledged silently.
    async fn destroy(&self, id: SessionId);
}
