//! Filesystem part store
//!
//! Layout under the storage root:
//! - `<recording-id>/recording.json`: the aggregate
//! - `<recording-id>/parts/<index>.part`: one file per encoded part
//!
//! A part file starts with a fixed little-endian header (magic, sample rate,
//! channels, frame size, sample count) followed by the encoded payload.
//! Files are written to a `.tmp` sibling and renamed into place.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::ports::{PartStore, PartStream, StoreError};
use crate::domain::recording::{
    AudioFormat, NewRecordingPart, Recording, RecordingId, RecordingMeta, RecordingPart, SessionId,
};

const AGGREGATE_FILE: &str = "recording.json";
const PARTS_DIR: &str = "parts";
const PART_EXTENSION: &str = "part";
const TEMP_EXTENSION: &str = "tmp";

const PART_MAGIC: [u8; 4] = *b"VXP1";
const HEADER_LEN: usize = 20;

/// Part store rooted at a directory
pub struct FsPartStore {
    root: PathBuf,
    /// Encoder id to recording bindings made by this instance.
    /// Also serializes every write.
    bindings: Mutex<HashMap<SessionId, RecordingId>>,
}

impl FsPartStore {
    /// Open (creating if needed) the store at `root` and repair any
    /// aggregate left stale by an interrupted write
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let store = Self {
            root,
            bindings: Mutex::new(HashMap::new()),
        };
        let repaired = store.reconcile().await?;
        if repaired > 0 {
            info!(repaired, root = %store.root.display(), "Repaired recording aggregates");
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn recording_dir(&self, id: &RecordingId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Rebuild every aggregate from its part files and drop leftover
    /// temporary files. Returns the number of aggregates rewritten.
    pub async fn reconcile(&self) -> Result<usize, StoreError> {
        let _writes = self.bindings.lock().await;
        let mut repaired = 0;

        for id in self.recording_ids().await? {
            let dir = self.recording_dir(&id);
            let mut recording = match read_aggregate(&dir, &id).await {
                Ok(recording) => recording,
                Err(e) => {
                    warn!(recording = %id, "Skipping unreadable recording: {}", e);
                    continue;
                }
            };
            remove_temp_files(&dir).await;
            remove_temp_files(&dir.join(PARTS_DIR)).await;

            let mut size = 0u64;
            let mut duration_ms = 0.0;
            let mut part_count = 0u64;
            let parts = match list_parts(&dir).await {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(recording = %id, "Skipping recording without parts: {}", e);
                    continue;
                }
            };
            for (_, path) in parts {
                match read_part(&path, &id, 0).await {
                    Ok(part) => {
                        size += part.encoded.len() as u64;
                        duration_ms += part.format.millis_for(part.sample_count);
                        part_count += 1;
                    }
                    Err(e) => warn!(path = %path.display(), "Ignoring unreadable part: {}", e),
                }
            }

            let stale = recording.size != size
                || recording.part_count != part_count
                || (recording.duration_ms - duration_ms).abs() > 1e-6;
            if stale {
                debug!(
                    recording = %id,
                    from = recording.part_count,
                    to = part_count,
                    "Rebuilding aggregate"
                );
                recording.size = size;
                recording.duration_ms = duration_ms;
                recording.part_count = part_count;
                write_aggregate(&dir, &recording).await?;
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    async fn recording_ids(&self) -> Result<Vec<RecordingId>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_string_lossy().parse::<RecordingId>() {
                Ok(id) => ids.push(id),
                Err(_) => debug!(dir = ?name, "Ignoring foreign directory"),
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl PartStore for FsPartStore {
    async fn create(&self, meta: RecordingMeta) -> Result<RecordingId, StoreError> {
        let mut bindings = self.bindings.lock().await;
        let id = RecordingId::generate();
        let dir = self.recording_dir(&id);
        fs::create_dir_all(dir.join(PARTS_DIR)).await?;

        let recording = Recording::new(id.clone(), &meta);
        if let Err(e) = write_aggregate(&dir, &recording).await {
            let _ = fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        bindings.insert(meta.encoder_id, id.clone());
        debug!(recording = %id, encoder_id = meta.encoder_id, "Recording created");
        Ok(id)
    }

    async fn add_recording_part(&self, part: NewRecordingPart) -> Result<bool, StoreError> {
        let bindings = self.bindings.lock().await;
        let id = bindings
            .get(&part.encoder_id)
            .ok_or(StoreError::UnknownEncoder(part.encoder_id))?;
        let dir = self.recording_dir(id);
        let mut recording = read_aggregate(&dir, id).await?;

        let part_path = part_file(&dir, part.part_index);
        if fs::try_exists(&part_path).await? {
            return Ok(false);
        }
        write_atomic(&part_path, &encode_part(&part)).await?;

        recording.absorb(&part);
        if let Err(e) = write_aggregate(&dir, &recording).await {
            // Keep the aggregate and the part files in agreement.
            if let Err(remove) = fs::remove_file(&part_path).await {
                warn!(path = %part_path.display(), "Failed to remove orphaned part: {}", remove);
            }
            return Err(e);
        }
        Ok(true)
    }

    fn parts_ordered_by_index(&self, id: &RecordingId) -> PartStream {
        enum Cursor {
            Unlisted(PathBuf, RecordingId),
            Listed(RecordingId, VecDeque<(u64, PathBuf)>),
            Done,
        }

        let start = Cursor::Unlisted(self.recording_dir(id), id.clone());
        stream::unfold(start, |cursor| async move {
            let (id, mut files) = match cursor {
                Cursor::Done => return None,
                Cursor::Listed(id, files) => (id, files),
                Cursor::Unlisted(dir, id) => {
                    if !fs::try_exists(dir.join(AGGREGATE_FILE)).await.unwrap_or(false) {
                        return Some((Err(StoreError::NotFound(id)), Cursor::Done));
                    }
                    match list_parts(&dir).await {
                        Ok(files) => (id, VecDeque::from(files)),
                        Err(e) => return Some((Err(e), Cursor::Done)),
                    }
                }
            };

            let (index, path) = files.pop_front()?;
            match read_part(&path, &id, index).await {
                Ok(part) => Some((Ok(part), Cursor::Listed(id, files))),
                Err(e) => Some((Err(e), Cursor::Done)),
            }
        })
        .boxed()
    }

    async fn get(&self, id: &RecordingId) -> Result<Recording, StoreError> {
        read_aggregate(&self.recording_dir(id), id).await
    }

    async fn list(&self) -> Result<Vec<Recording>, StoreError> {
        let mut recordings = Vec::new();
        for id in self.recording_ids().await? {
            match read_aggregate(&self.recording_dir(&id), &id).await {
                Ok(recording) => recordings.push(recording),
                Err(e) => warn!(recording = %id, "Skipping unreadable recording: {}", e),
            }
        }
        recordings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(recordings)
    }

    async fn delete(&self, id: &RecordingId) -> Result<(), StoreError> {
        let mut bindings = self.bindings.lock().await;
        let dir = self.recording_dir(id);
        if !fs::try_exists(&dir).await? {
            return Err(StoreError::NotFound(id.clone()));
        }
        fs::remove_dir_all(&dir).await?;
        bindings.retain(|_, bound| bound != id);
        debug!(recording = %id, "Recording deleted");
        Ok(())
    }
}

fn part_file(dir: &Path, index: u64) -> PathBuf {
    dir.join(PARTS_DIR)
        .join(format!("{:08}.{}", index, PART_EXTENSION))
}

/// Part files of a recording sorted by index
async fn list_parts(dir: &Path) -> Result<Vec<(u64, PathBuf)>, StoreError> {
    let mut parts = Vec::new();
    let mut entries = fs::read_dir(dir.join(PARTS_DIR)).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(PART_EXTENSION) {
            continue;
        }
        let index = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        match index {
            Some(index) => parts.push((index, path)),
            None => debug!(path = %path.display(), "Ignoring misnamed part file"),
        }
    }
    parts.sort_by_key(|(index, _)| *index);
    Ok(parts)
}

async fn read_aggregate(dir: &Path, id: &RecordingId) -> Result<Recording, StoreError> {
    let content = match fs::read_to_string(dir.join(AGGREGATE_FILE)).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(id.clone()))
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content)
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", AGGREGATE_FILE, e)))
}

async fn write_aggregate(dir: &Path, recording: &Recording) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(recording)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    write_atomic(&dir.join(AGGREGATE_FILE), &content).await
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let temp = path.with_extension(TEMP_EXTENSION);
    fs::write(&temp, bytes).await?;
    if let Err(e) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_temp_files(dir: &Path) {
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXTENSION)
            && fs::remove_file(&path).await.is_ok()
        {
            debug!(path = %path.display(), "Removed leftover temporary file");
        }
    }
}

fn encode_part(part: &NewRecordingPart) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + part.encoded.len());
    bytes.extend_from_slice(&PART_MAGIC);
    bytes.extend_from_slice(&part.format.sample_rate.to_le_bytes());
    bytes.extend_from_slice(&part.format.channels.to_le_bytes());
    bytes.extend_from_slice(&[0, 0]);
    bytes.extend_from_slice(&(part.format.frame_size as u32).to_le_bytes());
    bytes.extend_from_slice(&part.sample_count.to_le_bytes());
    bytes.extend_from_slice(&part.encoded);
    bytes
}

fn decode_part(
    bytes: Vec<u8>,
    recording_id: &RecordingId,
    part_index: u64,
) -> Result<RecordingPart, StoreError> {
    if bytes.len() < HEADER_LEN || bytes[..4] != PART_MAGIC {
        return Err(StoreError::Corrupt(format!(
            "part {} of {} has no valid header",
            part_index, recording_id
        )));
    }
    let u32_at =
        |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let format = AudioFormat {
        sample_rate: u32_at(4),
        channels: u16::from_le_bytes([bytes[8], bytes[9]]),
        frame_size: u32_at(12) as usize,
    };
    let sample_count = u32_at(16);
    Ok(RecordingPart {
        recording_id: recording_id.clone(),
        part_index,
        encoded: bytes[HEADER_LEN..].to_vec(),
        sample_count,
        format,
    })
}

async fn read_part(
    path: &Path,
    recording_id: &RecordingId,
    part_index: u64,
) -> Result<RecordingPart, StoreError> {
    let bytes = fs::read(path).await?;
    decode_part(bytes, recording_id, part_index)
}
