//! Shell sessions.
//!
//! A session is one shell process attached to a pseudo-terminal. Its output is
//! fanned out to independent consumers (the live channel and the recorder),
//! and the [`SessionRegistry`] enforces that at most one session runs per
//! connection.

pub mod fanout;
pub mod pty;
pub mod registry;

use bytes::Bytes;
use thiserror::Error;

pub use fanout::{FanoutStats, OutputFanout, SubscriberId, DEFAULT_LIVE_CAPACITY};
pub use pty::{PtySession, SessionStatus, ShellSpec};
pub use registry::{SessionRegistry, SlotState, SpawnedSession};

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
///
/// The `Display` text of [`SessionError::AlreadyRunning`] and
/// [`SessionError::NotFound`] is sent verbatim to operators.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A shell is already starting or running on this connection.
    #[error("shell is already running")]
    AlreadyRunning,

    /// No running session has this id.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Failed to allocate the pty or spawn the shell.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    /// Failed to write to the pty.
    #[error("failed to write to shell: {0}")]
    WriteFailed(String),

    /// Failed to resize the pty.
    #[error("failed to resize terminal: {0}")]
    ResizeFailed(String),

    /// Failed to kill or reap the shell.
    #[error("failed to stop shell: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether the terminal currently echoes typed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoMode {
    #[default]
    Enabled,
    Disabled,
}

impl EchoMode {
    pub fn is_enabled(self) -> bool {
        matches!(self, EchoMode::Enabled)
    }
}

/// A chunk of shell output, tagged with the echo mode observed right after
/// it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub data: Bytes,
    pub echo: EchoMode,
}

impl OutputChunk {
    pub fn new(data: impl Into<Bytes>, echo: EchoMode) -> Self {
        Self {
            data: data.into(),
            echo,
        }
    }
}
