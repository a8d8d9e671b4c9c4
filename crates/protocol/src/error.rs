//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering codec and framing failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Input was well-formed MessagePack but not a recognizable message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Input ended before a complete message or frame was read.
    #[error("truncated input: {0}")]
    Framing(String),

    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame has invalid magic bytes.
    #[error("invalid frame magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidFrameMagic {
        /// Expected magic value.
        expected: u32,
        /// Actual magic value read.
        got: u32,
    },

    /// Compressed frame payload could not be inflated.
    #[error("failed to decompress payload: {0}")]
    Decompression(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        use rmp_serde::decode::Error;
        match &err {
            Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io)
                if io.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                ProtocolError::Framing(err.to_string())
            }
            _ => ProtocolError::Deserialization(err.to_string()),
        }
    }
}
