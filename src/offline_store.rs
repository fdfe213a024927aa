use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::error::{AppError, ErrorKind};
use crate::model::{AnalysisStatus, AppState, ImageStatus, UnixTimeMs};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;
const MAX_IMAGES: usize = 10_000;
const SNAPSHOT_MAGIC: &[u8; 4] = b"UXSS";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted snapshot: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("snapshot too large: {size} bytes, max {max}")]
    SnapshotTooLarge { size: usize, max: usize },

    #[error("too many images: {count}, max {max}")]
    TooManyImages { count: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for SnapshotError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        SnapshotError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for SnapshotError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        SnapshotError::Serialization(e.to_string())
    }
}

impl From<SnapshotError> for AppError {
    fn from(err: SnapshotError) -> Self {
        let kind = match &err {
            SnapshotError::Io(_) => ErrorKind::Storage,
            SnapshotError::SnapshotTooLarge { .. } | SnapshotError::TooManyImages { .. } => {
                ErrorKind::QuotaExceeded
            }
            SnapshotError::Serialization(_) => ErrorKind::Serialization,
            _ => ErrorKind::Deserialization,
        };
        AppError::new(kind, "Saved session could not be used").with_internal(err.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotPayload {
    saved_at: UnixTimeMs,
    state: AppState,
}

/// A session restored from disk, already made safe to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredSession {
    pub saved_at: UnixTimeMs,
    pub state: AppState,
    /// Temporary images whose upload was interrupted by the shutdown.
    pub interrupted: usize,
}

pub fn encode(state: &AppState, saved_at: UnixTimeMs) -> Result<Vec<u8>, SnapshotError> {
    if state.images.len() > MAX_IMAGES {
        return Err(SnapshotError::TooManyImages {
            count: state.images.len(),
            max: MAX_IMAGES,
        });
    }

    let payload = SnapshotPayload {
        saved_at,
        state: state.clone(),
    };
    let mut payload_bytes = Vec::new();
    ciborium::into_writer(&payload, &mut payload_bytes)?;

    let checksum = blake3::hash(&payload_bytes);
    let envelope = SnapshotEnvelope {
        magic: *SNAPSHOT_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload: payload_bytes,
    };

    let mut envelope_bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut envelope_bytes)?;

    if envelope_bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(SnapshotError::SnapshotTooLarge {
            size: envelope_bytes.len(),
            max: MAX_SNAPSHOT_BYTES,
        });
    }
    Ok(envelope_bytes)
}

pub fn decode(bytes: &[u8]) -> Result<RestoredSession, SnapshotError> {
    if bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(SnapshotError::SnapshotTooLarge {
            size: bytes.len(),
            max: MAX_SNAPSHOT_BYTES,
        });
    }

    let envelope: SnapshotEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *SNAPSHOT_MAGIC {
        return Err(SnapshotError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(SnapshotError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }
    if envelope.schema_version < CURRENT_SCHEMA_VERSION {
        return Err(SnapshotError::UnknownSchema(envelope.schema_version));
    }

    let actual_checksum = blake3::hash(&envelope.payload);
    if actual_checksum.as_bytes() != &envelope.checksum {
        return Err(SnapshotError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual_checksum.as_bytes()),
        });
    }

    let payload: SnapshotPayload = ciborium::from_reader(&envelope.payload[..])?;

    if payload.state.images.len() > MAX_IMAGES {
        return Err(SnapshotError::TooManyImages {
            count: payload.state.images.len(),
            max: MAX_IMAGES,
        });
    }

    let mut state = payload.state;
    let interrupted = settle_interrupted(&mut state);
    Ok(RestoredSession {
        saved_at: payload.saved_at,
        state,
        interrupted,
    })
}

/// The queue is not persisted: nothing is pending after a restart, and
/// temporary images still in flight can never finish on their own.
fn settle_interrupted(state: &mut AppState) -> usize {
    state.pending_sync.clear();
    state.is_uploading = false;
    state.is_syncing = false;

    let mut interrupted = Vec::new();
    for image in &mut state.images {
        if image.id.is_temporary() && image.status.is_in_progress() {
            image.status = ImageStatus::Error;
            interrupted.push(image.id.clone());
        }
    }
    for analysis in &mut state.analyses {
        if analysis.status == AnalysisStatus::Processing && interrupted.contains(&analysis.image_id)
        {
            analysis.status = AnalysisStatus::Failed;
        }
    }
    interrupted.len()
}

/// Writes through a sibling temp file and renames it into place.
#[instrument(skip(state), fields(images = state.images.len()))]
pub fn save_to_path(path: &Path, state: &AppState) -> Result<(), SnapshotError> {
    let bytes = encode(state, UnixTimeMs::now())?;

    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    debug!(bytes = bytes.len(), "session snapshot written");
    Ok(())
}

/// Returns `None` when no snapshot was saved yet.
#[instrument]
pub fn load_from_path(path: &Path) -> Result<Option<RestoredSession>, SnapshotError> {
    if !path.exists() {
        return Ok(None);
    }

    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Err(SnapshotError::Corrupted {
            reason: "empty file",
        });
    }

    let restored = decode(&bytes)?;
    info!(
        images = restored.state.images.len(),
        interrupted = restored.interrupted,
        "session snapshot loaded"
    );
    Ok(Some(restored))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Analysis, Dimensions, EntityId, Image, ImageId};
    use tempfile::tempdir;

    fn sample_state() -> AppState {
        let temp = ImageId::new("temp-1");
        let done = ImageId::new("img-1");
        let mut completed =
            Image::placeholder(done.clone(), "done.png", Dimensions::new(4, 4), None, None);
        completed.status = ImageStatus::Completed;

        let mut state = AppState {
            images: vec![
                Image::placeholder(temp.clone(), "a.png", Dimensions::new(2, 2), None, None),
                completed,
            ],
            analyses: vec![Analysis::placeholder(temp.clone()), Analysis::placeholder(done)],
            selected_image_id: Some(temp.clone()),
            is_uploading: true,
            ..AppState::default()
        };
        state.pending_sync.insert(EntityId::from(&temp));
        state
    }

    #[test]
    fn roundtrip_settles_interrupted_uploads() {
        let bytes = encode(&sample_state(), UnixTimeMs(42)).unwrap();
        let restored = decode(&bytes).unwrap();

        assert_eq!(restored.saved_at, UnixTimeMs(42));
        assert_eq!(restored.interrupted, 1);

        let state = restored.state;
        assert!(state.pending_sync.is_empty());
        assert!(!state.is_uploading);
        assert_eq!(state.images[0].status, ImageStatus::Error);
        assert_eq!(state.images[1].status, ImageStatus::Completed);
        assert_eq!(state.analyses[0].status, AnalysisStatus::Failed);
        // Canonical images keep their analysis untouched.
        assert_eq!(state.analyses[1].status, AnalysisStatus::Processing);
        assert_eq!(state.selected_image_id, Some(ImageId::new("temp-1")));
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.bin");

        save_to_path(&path, &sample_state()).unwrap();
        let restored = load_from_path(&path).unwrap().unwrap();

        assert_eq!(restored.state.images.len(), 2);
    }

    #[test]
    fn load_nonexistent_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nonexistent.bin");
        assert!(load_from_path(&path).unwrap().is_none());
    }

    #[test]
    fn empty_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        assert!(matches!(
            load_from_path(&path),
            Err(SnapshotError::Corrupted { .. })
        ));
    }

    #[test]
    fn tampered_payload_fails_integrity_check() {
        let payload = SnapshotPayload {
            saved_at: UnixTimeMs(1),
            state: AppState::default(),
        };
        let mut payload_bytes = Vec::new();
        ciborium::into_writer(&payload, &mut payload_bytes).unwrap();

        let envelope = SnapshotEnvelope {
            magic: *SNAPSHOT_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: [0u8; 32],
            payload: payload_bytes,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        match decode(&bytes) {
            Err(SnapshotError::IntegrityCheckFailed { expected, .. }) => {
                assert_eq!(expected, "0".repeat(64));
            }
            other => panic!("expected integrity failure, got {other:?}"),
        }
    }

    #[test]
    fn wrong_magic_and_future_schema_are_rejected() {
        let mut envelope = SnapshotEnvelope {
            magic: *b"NOPE",
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: [0u8; 32],
            payload: Vec::new(),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();
        assert!(matches!(decode(&bytes), Err(SnapshotError::Corrupted { .. })));

        envelope.magic = *SNAPSHOT_MAGIC;
        envelope.schema_version = CURRENT_SCHEMA_VERSION + 1;
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();
        assert!(matches!(
            decode(&bytes),
            Err(SnapshotError::FutureSchema { found: 2, max: 1 })
        ));
    }

    #[test]
    fn oversized_input_rejected() {
        let oversized = vec![0u8; MAX_SNAPSHOT_BYTES + 1];
        assert!(matches!(
            decode(&oversized),
            Err(SnapshotError::SnapshotTooLarge { .. })
        ));
    }

    #[test]
    fn atomic_write_leaves_no_tmp_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.bin");
        let tmp_path = path.with_extension("tmp");

        save_to_path(&path, &AppState::default()).unwrap();

        assert!(path.exists());
        assert!(!tmp_path.exists());
    }
}
