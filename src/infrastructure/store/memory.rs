//! In-memory part store

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::application::ports::{PartStore, PartStream, StoreError};
use crate::domain::recording::{
    NewRecordingPart, Recording, RecordingId, RecordingMeta, RecordingPart, SessionId,
};

struct StoredRecording {
    recording: Recording,
    parts: BTreeMap<u64, RecordingPart>,
}

#[derive(Default)]
struct State {
    recordings: HashMap<RecordingId, StoredRecording>,
    by_encoder: HashMap<SessionId, RecordingId>,
}

/// Part store that keeps everything in process memory
#[derive(Default)]
pub struct MemoryPartStore {
    state: Mutex<State>,
}

impl MemoryPartStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PartStore for MemoryPartStore {
    async fn create(&self, meta: RecordingMeta) -> Result<RecordingId, StoreError> {
        let id = RecordingId::generate();
        let mut state = self.lock();
        state.by_encoder.insert(meta.encoder_id, id.clone());
        state.recordings.insert(
            id.clone(),
            StoredRecording {
                recording: Recording::new(id.clone(), &meta),
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn add_recording_part(&self, part: NewRecordingPart) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let id = state
            .by_encoder
            .get(&part.encoder_id)
            .cloned()
            .ok_or(StoreError::UnknownEncoder(part.encoder_id))?;
        let stored = state
            .recordings
            .get_mut(&id)
            .ok_or(StoreError::UnknownEncoder(part.encoder_id))?;

        if stored.parts.contains_key(&part.part_index) {
            return Ok(false);
        }
        stored.recording.absorb(&part);
        stored.parts.insert(
            part.part_index,
            RecordingPart {
                recording_id: id,
                part_index: part.part_index,
                encoded: part.encoded,
                sample_count: part.sample_count,
                format: part.format,
            },
        );
        Ok(true)
    }

    fn parts_ordered_by_index(&self, id: &RecordingId) -> PartStream {
        let items: Vec<Result<RecordingPart, StoreError>> = match self.lock().recordings.get(id)
        {
            Some(stored) => stored.parts.values().cloned().map(Ok).collect(),
            None => vec![Err(StoreError::NotFound(id.clone()))],
        };
        stream::iter(items).boxed()
    }

    async fn get(&self, id: &RecordingId) -> Result<Recording, StoreError> {
        self.lock()
            .recordings
            .get(id)
            .map(|stored| stored.recording.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list(&self) -> Result<Vec<Recording>, StoreError> {
        let mut recordings: Vec<Recording> = self
            .lock()
            .recordings
            .values()
            .map(|stored| stored.recording.clone())
            .collect();
        recordings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(recordings)
    }

    async fn delete(&self, id: &RecordingId) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.recordings.remove(id).is_none() {
            return Err(StoreError::NotFound(id.clone()));
        }
        state.by_encoder.retain(|_, bound| bound != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recording::AudioFormat;

    fn meta(encoder_id: SessionId) -> RecordingMeta {
        RecordingMeta {
            encoder_id,
            format: AudioFormat::mono(48_000),
            device: None,
        }
    }

    fn part(encoder_id: SessionId, part_index: u64, len: usize) -> NewRecordingPart {
        NewRecordingPart {
            encoder_id,
            part_index,
            sample_count: 4800,
            format: AudioFormat::mono(48_000),
            encoded: vec![part_index as u8; len],
        }
    }

    #[tokio::test]
    async fn parts_come_back_in_index_order() {
        let store = MemoryPartStore::new();
        let id = store.create(meta(1)).await.unwrap();
        for index in [2, 0, 1] {
            assert!(store.add_recording_part(part(1, index, 10)).await.unwrap());
        }

        let indices: Vec<u64> = store
            .parts_ordered_by_index(&id)
            .map(|p| p.unwrap().part_index)
            .collect()
            .await;
        assert_eq!(indices, vec![0, 1, 2]);

        let recording = store.get(&id).await.unwrap();
        assert_eq!(recording.part_count, 3);
        assert_eq!(recording.size, 30);
        assert!((recording.duration_ms - 300.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_encoder_is_a_hard_error() {
        let store = MemoryPartStore::new();
        store.create(meta(1)).await.unwrap();
        assert!(matches!(
            store.add_recording_part(part(9, 0, 10)).await,
            Err(StoreError::UnknownEncoder(9))
        ));
    }

    #[tokio::test]
    async fn duplicate_index_is_not_stored_twice() {
        let store = MemoryPartStore::new();
        let id = store.create(meta(1)).await.unwrap();
        assert!(store.add_recording_part(part(1, 0, 10)).await.unwrap());
        assert!(!store.add_recording_part(part(1, 0, 99)).await.unwrap());
        assert_eq!(store.get(&id).await.unwrap().size, 10);
    }

    #[tokio::test]
    async fn delete_unbinds_encoder() {
        let store = MemoryPartStore::new();
        let id = store.create(meta(1)).await.unwrap();
        store.delete(&id).await.unwrap();

        assert!(matches!(store.get(&id).await, Err(StoreError::NotFound(_))));
        assert!(store.add_recording_part(part(1, 0, 10)).await.is_err());
        assert!(matches!(store.delete(&id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn missing_recording_streams_one_error() {
        let store = MemoryPartStore::new();
        let items: Vec<_> = store
            .parts_ordered_by_index(&RecordingId::generate())
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(StoreError::NotFound(_))));
    }
}
