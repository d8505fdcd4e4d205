//! Part store port

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::domain::recording::{
    NewRecordingPart, Recording, RecordingId, RecordingMeta, RecordingPart, SessionId,
};

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No recording is bound to the encoder id of a part insert
    #[error("Store inconsistency: no recording is bound to encoder {0}")]
    UnknownEncoder(SessionId),

    #[error("Recording not found: {0}")]
    NotFound(RecordingId),

    #[error("Storage I/O failed: {0}")]
    Io(String),

    #[error("Stored data is corrupt: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Lazy, finite, one-shot sequence of parts in index order
pub type PartStream = BoxStream<'static, Result<RecordingPart, StoreError>>;

/// Port for persisting recordings and their ordered parts
#[async_trait]
pub trait PartStore: Send + Sync {
    /// Create an empty recording bound to `meta.encoder_id`
    async fn create(&self, meta: RecordingMeta) -> Result<RecordingId, StoreError>;

    /// Insert a part and update the recording aggregate as one logical unit.
    ///
    /// # Errors
    /// `StoreError::UnknownEncoder` when no recording is bound to the encoder
    async fn add_recording_part(&self, part: NewRecordingPart) -> Result<bool, StoreError>;

    /// Parts of a recording in ascending `part_index` order
    fn parts_ordered_by_index(&self, id: &RecordingId) -> PartStream;

    /// Load a recording aggregate
    async fn get(&self, id: &RecordingId) -> Result<Recording, StoreError>;

    /// All recordings, newest first
    async fn list(&self) -> Result<Vec<Recording>, StoreError>;

    /// Remove a recording and its parts
    async fn delete(&self, id: &RecordingId) -> Result<(), StoreError>;
}
