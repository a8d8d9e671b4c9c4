//! # DevTerm Protocol Library
//!
//! Wire types shared by the DevTerm agent and anything that talks to it:
//!
//! - **Messages**: typed header + opaque body, MessagePack encoded
//! - **Frame Codec**: length-prefixed framing with optional LZ4 compression,
//!   used for durable session recordings
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::messages::{proto, typ, ProtocolMessage, Status};
//!
//! let request = ProtocolMessage::new(proto::SHELL, typ::SPAWN);
//! let bytes = request.encode().unwrap();
//!
//! let decoded = ProtocolMessage::decode(&bytes).unwrap();
//! let reply = ProtocolMessage::response_to(&decoded).with_status(Status::Normal);
//! assert_eq!(reply.typ(), "new");
//! ```

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, FrameFlags, FrameReader, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE,
    FRAME_MAGIC, MAX_FRAME_SIZE,
};
pub use messages::{
    decode_header_lossy, ErrorBody, PropValue, ProtocolHeader, ProtocolMessage, Status,
    MSG_BODY_SHELL_STARTED,
};
