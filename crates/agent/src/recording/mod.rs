//! Session recording.
//!
//! Every session's output is persisted as an append-only log of
//! [`RecordedChunk`]s in a keyed blob store. A log is sealed when its session
//! ends; only sealed logs can be played back.

pub mod lock;
pub mod log;
pub mod recorder;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::EchoMode;

pub use lock::DirLock;
pub use log::{decode_log, encode_chunk};
pub use recorder::{RecorderHandle, RecorderSettings, RecorderStats, SessionRecorder};
pub use store::{FileRecordingStore, MemoryRecordingStore, RecordingInfo, RecordingStore};

/// Errors raised by recording stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No recording exists under this key, or it is not sealed yet.
    #[error("recording not found: {0}")]
    NotFound(String),

    /// The recording was sealed and can no longer be written.
    #[error("recording already sealed: {0}")]
    Sealed(String),

    /// The key cannot be used as a storage name.
    #[error("invalid recording key: {0:?}")]
    InvalidKey(String),

    /// Another agent owns the recordings directory.
    #[error("recordings directory {path} is in use by process {pid}")]
    Locked { path: PathBuf, pid: u32 },

    #[error("recording log is corrupt: {0}")]
    Corrupt(String),

    #[error("storage I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One recorded output chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedChunk {
    /// Position in the recording, starting at 0.
    pub seq: u64,
    /// Milliseconds since the recording started.
    pub at_ms: u64,
    /// Echo mode in effect when the chunk was produced.
    pub echo: EchoMode,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Where and how sessions get recorded.
#[derive(Clone)]
pub struct RecordingSink {
    pub store: Arc<dyn RecordingStore>,
    pub settings: RecorderSettings,
}

impl RecordingSink {
    pub fn new(store: Arc<dyn RecordingStore>, settings: RecorderSettings) -> Self {
        Self { store, settings }
    }
}
