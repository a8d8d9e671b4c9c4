//! Keyed blob stores for recordings.
//!
//! A store knows nothing about the log format: it appends opaque bytes under a
//! key, seals the key, and hands back the bytes of sealed keys. All methods
//! block and are meant to be called from `spawn_blocking`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::StoreError;

/// Summary of a sealed recording.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RecordingInfo {
    pub key: String,
    pub size_bytes: u64,
}

/// Opaque keyed blob storage with an open/sealed lifecycle per key.
pub trait RecordingStore: Send + Sync {
    /// Start a new, empty recording. Fails if the key already exists.
    fn create(&self, key: &str) -> Result<(), StoreError>;

    /// Append bytes to an open recording and make them durable.
    ///
    /// All or nothing: after an error the recording is as it was, so the
    /// caller can retry the same bytes.
    fn append(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Make a recording immutable and available for reading.
    fn seal(&self, key: &str) -> Result<(), StoreError>;

    /// Read a sealed recording in full.
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// List sealed recordings.
    fn list(&self) -> Result<Vec<RecordingInfo>, StoreError>;
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

const SEALED_EXT: &str = "rec";
const OPEN_EXT: &str = "rec.part";

/// Recordings stored as files: `<key>.rec.part` while open, renamed to
/// `<key>.rec` when sealed.
pub struct FileRecordingStore {
    dir: PathBuf,
    open: DashMap<String, File>,
}

impl FileRecordingStore {
    /// Open the store, creating the directory.
    ///
    /// Opening has no side effects on existing recordings, so readers can
    /// open a directory another agent is writing to. Only the directory's
    /// owner calls [`recover_leftovers`](Self::recover_leftovers).
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        Ok(Self {
            dir,
            open: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn sealed_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{SEALED_EXT}"))
    }

    fn open_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{OPEN_EXT}"))
    }

    /// Seal, as they are, recordings left open by a previous run.
    ///
    /// Requires the directory's [`DirLock`](super::DirLock): a `.rec.part`
    /// file is only a leftover when no other agent can still be writing it.
    /// Returns how many recordings were sealed.
    pub fn recover_leftovers(&self, lock: &super::DirLock) -> Result<usize, StoreError> {
        debug_assert_eq!(lock.path().parent(), Some(self.dir.as_path()));
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut recovered = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(|n| n.strip_suffix(&format!(".{OPEN_EXT}")))
            else {
                continue;
            };
            if validate_key(key).is_err() {
                continue;
            }
            tracing::warn!(recording = %key, "Sealing recording left open by a previous run");
            let sealed = self.sealed_path(key);
            fs::rename(entry.path(), &sealed).map_err(|source| StoreError::Io {
                path: sealed,
                source,
            })?;
            recovered += 1;
        }
        Ok(recovered)
    }
}

impl RecordingStore for FileRecordingStore {
    fn create(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        if self.sealed_path(key).exists() {
            return Err(StoreError::Sealed(key.to_string()));
        }

        let path = self.open_path(key);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|source| StoreError::Io { path, source })?;
        self.open.insert(key.to_string(), file);
        Ok(())
    }

    fn append(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut file = match self.open.get_mut(key) {
            Some(file) => file,
            None if self.sealed_path(key).exists() => {
                return Err(StoreError::Sealed(key.to_string()))
            }
            None => return Err(StoreError::NotFound(key.to_string())),
        };
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.open_path(key),
            source,
        };
        let len = file.metadata().map_err(io_err)?.len();
        let written = file.write_all(bytes).and_then(|()| file.sync_data());
        if let Err(e) = written {
            // drop a torn tail so a retry does not duplicate it
            if let Err(truncate) = file.set_len(len) {
                tracing::warn!(recording = %key, error = %truncate, "Failed to roll back partial append");
            }
            return Err(io_err(e));
        }
        Ok(())
    }

    fn seal(&self, key: &str) -> Result<(), StoreError> {
        let Some((_, file)) = self.open.remove(key) else {
            return if self.sealed_path(key).exists() {
                Err(StoreError::Sealed(key.to_string()))
            } else {
                Err(StoreError::NotFound(key.to_string()))
            };
        };
        let open_path = self.open_path(key);
        file.sync_all().map_err(|source| StoreError::Io {
            path: open_path.clone(),
            source,
        })?;
        drop(file);

        let sealed = self.sealed_path(key);
        fs::rename(&open_path, &sealed).map_err(|source| StoreError::Io {
            path: sealed,
            source,
        })
    }

    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        let path = self.sealed_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn list(&self) -> Result<Vec<RecordingInfo>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut recordings: Vec<RecordingInfo> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let key = name.to_str()?.strip_suffix(&format!(".{SEALED_EXT}"))?.to_string();
                let size_bytes = entry.metadata().ok()?.len();
                Some(RecordingInfo { key, size_bytes })
            })
            .collect();
        recordings.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(recordings)
    }
}

#[derive(Default)]
struct MemoryEntry {
    bytes: Vec<u8>,
    sealed: bool,
}

/// In-memory store, for tests and for running without a writable data dir.
#[derive(Default)]
pub struct MemoryRecordingStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryRecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the recording exists, sealed or not.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_sealed(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|e| e.sealed)
    }
}

impl RecordingStore for MemoryRecordingStore {
    fn create(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Err(StoreError::Sealed(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(MemoryEntry::default());
                Ok(())
            }
        }
    }

    fn append(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if entry.sealed {
            return Err(StoreError::Sealed(key.to_string()));
        }
        entry.bytes.extend_from_slice(bytes);
        Ok(())
    }

    fn seal(&self, key: &str) -> Result<(), StoreError> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if entry.sealed {
            return Err(StoreError::Sealed(key.to_string()));
        }
        entry.sealed = true;
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match self.entries.get(key) {
            Some(entry) if entry.sealed => Ok(entry.bytes.clone()),
            _ => Err(StoreError::NotFound(key.to_string())),
        }
    }

    fn list(&self) -> Result<Vec<RecordingInfo>, StoreError> {
        let mut recordings: Vec<RecordingInfo> = self
            .entries
            .iter()
            .filter(|e| e.sealed)
            .map(|e| RecordingInfo {
                key: e.key().clone(),
                size_bytes: e.bytes.len() as u64,
            })
            .collect();
        recordings.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(recordings)
    }
}
