//! Audio input port

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifier of an input device (the device name reported by the host)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Description of an opened or available input device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    /// Native sample rate of the stream
    pub sample_rate: u32,
    /// Native channel count (streams are delivered downmixed to mono)
    pub channels: u16,
    pub is_default: bool,
}

/// Input acquisition errors
#[derive(Debug, Clone, Error)]
pub enum InputError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Input device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Input device configuration unsupported: {0}")]
    Unsupported(String),

    #[error("Input stream failed: {0}")]
    Transport(String),
}

/// A live capture stream delivering mono `f32` blocks at the device rate
pub trait InputStream: Send {
    fn info(&self) -> &DeviceInfo;

    /// Take the sample receiver. Returns `None` after the first call.
    fn take_samples(&mut self) -> Option<mpsc::Receiver<Vec<f32>>>;

    /// Stop the stream's tracks. Idempotent.
    fn stop(&mut self);

    fn is_live(&self) -> bool;
}

/// Port for acquiring microphone streams
#[async_trait]
pub trait InputSource: Send + Sync {
    /// Open a stream on `device`, or on the system default when `None`
    async fn acquire(&self, device: Option<&DeviceId>) -> Result<Box<dyn InputStream>, InputError>;

    /// Enumerate input devices
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, InputError>;
}
