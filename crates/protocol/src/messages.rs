//! Typed protocol messages exchanged between the agent and the backend.
//!
//! Every message carries a header naming its protocol namespace (`proto`),
//! a string type tag (`typ`) and a map of scalar properties, followed by an
//! opaque binary body. Messages are serialized as MessagePack maps with
//! named fields:
//!
//! ```text
//! { "hdr": { "proto": u16, "typ": str, "props": { str: scalar } }, "body": bin }
//! ```
//!
//! Unknown `typ` values decode successfully; rejecting them is the router's job.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Protocol namespaces.
pub mod proto {
    /// Reserved, never valid on the wire.
    pub const INVALID: u16 = 0;
    /// Interactive shell sessions.
    pub const SHELL: u16 = 1;
    /// Keepalive and protocol-level errors.
    pub const CONTROL: u16 = 0xFFFF;
}

/// Message type tags.
pub mod typ {
    /// Spawn a new shell.
    pub const SPAWN: &str = "new";
    /// Shell input (operator to agent) or output (agent to operator).
    pub const SHELL_COMMAND: &str = "shell";
    /// Stop the running shell.
    pub const STOP: &str = "stop";
    /// Resize the running shell's terminal.
    pub const RESIZE: &str = "resize";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    /// Protocol-level error, used in the control namespace.
    pub const ERROR: &str = "error";
}

/// Recognized property keys.
pub mod props {
    pub const STATUS: &str = "status";
    pub const SESSION_ID: &str = "session_id";
    pub const TERMINAL_WIDTH: &str = "terminal_width";
    pub const TERMINAL_HEIGHT: &str = "terminal_height";
    pub const USER_ID: &str = "user_id";
}

/// Body of a successful spawn response.
pub const MSG_BODY_SHELL_STARTED: &[u8] = b"Shell started";

/// Value of the `status` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Normal,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Normal => "normal",
            Status::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(Status::Normal),
            "error" => Some(Status::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar property value.
///
/// Variant order matters for decoding: integers are tried before floats so a
/// MessagePack integer never turns into a float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl PropValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropValue::Int(i) => Some(*i),
            PropValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Float(f) => Some(*f),
            PropValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<u16> for PropValue {
    fn from(value: u16) -> Self {
        PropValue::Int(i64::from(value))
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Float(value)
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::Str(value.to_string())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::Str(value)
    }
}

impl From<Status> for PropValue {
    fn from(value: Status) -> Self {
        PropValue::Str(value.as_str().to_string())
    }
}

/// Message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolHeader {
    /// Protocol namespace, see [`proto`].
    pub proto: u16,
    /// Message type tag, see [`typ`].
    pub typ: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, PropValue>,
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    #[serde(rename = "hdr")]
    pub header: ProtocolHeader,
    #[serde(with = "serde_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
}

impl ProtocolMessage {
    /// Create a message with no properties and an empty body.
    pub fn new(proto: u16, typ: impl Into<String>) -> Self {
        Self {
            header: ProtocolHeader {
                proto,
                typ: typ.into(),
                props: BTreeMap::new(),
            },
            body: Vec::new(),
        }
    }

    /// Create a reply that echoes the request's namespace, type and session id.
    pub fn response_to(request: &ProtocolMessage) -> Self {
        let mut response = Self::new(request.header.proto, request.header.typ.clone());
        if let Some(id) = request.session_id() {
            response = response.with_session_id(id);
        }
        response
    }

    /// Create a `status=error` reply echoing `proto` and `typ` whose body is
    /// an encoded [`ErrorBody`].
    pub fn error_reply(proto: u16, typ: &str, err: impl fmt::Display) -> Self {
        let body = ErrorBody {
            err: err.to_string(),
            msg_proto: Some(proto),
            msg_type: Some(typ.to_string()),
        };
        // ErrorBody holds only strings and integers, encoding cannot fail
        let encoded = body.encode().unwrap_or_default();
        Self::new(proto, typ)
            .with_status(Status::Error)
            .with_body(encoded)
    }

    pub fn with_property(mut self, key: &str, value: impl Into<PropValue>) -> Self {
        self.header.props.insert(key.to_string(), value.into());
        self
    }

    pub fn with_status(self, status: Status) -> Self {
        self.with_property(props::STATUS, status)
    }

    pub fn with_session_id(self, session_id: &str) -> Self {
        self.with_property(props::SESSION_ID, session_id)
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn proto(&self) -> u16 {
        self.header.proto
    }

    pub fn typ(&self) -> &str {
        &self.header.typ
    }

    pub fn property(&self, key: &str) -> Option<&PropValue> {
        self.header.props.get(key)
    }

    /// The `status` property, if present and recognized.
    pub fn status(&self) -> Option<Status> {
        self.property(props::STATUS)
            .and_then(PropValue::as_str)
            .and_then(Status::parse)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.property(props::SESSION_ID).and_then(PropValue::as_str)
    }

    /// Read an integer property that must fit in a `u16`, such as a
    /// terminal dimension.
    pub fn property_u16(&self, key: &str) -> Option<u16> {
        self.property(key)
            .and_then(PropValue::as_i64)
            .and_then(|v| u16::try_from(v).ok())
    }

    /// Serialize to MessagePack bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack bytes.
    ///
    /// Truncated input yields [`ProtocolError::Framing`](crate::ProtocolError::Framing),
    /// anything else unrecognizable yields
    /// [`ProtocolError::Deserialization`](crate::ProtocolError::Deserialization).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[derive(Deserialize)]
struct LossyMessage {
    hdr: Option<LossyHeader>,
}

#[derive(Deserialize)]
struct LossyHeader {
    proto: Option<u16>,
    typ: Option<String>,
}

/// Recover `(proto, typ)` from a message whose body or properties failed to
/// decode, so the error reply can still be correlated with its request.
///
/// Returns `None` when not even the namespace can be read.
pub fn decode_header_lossy(bytes: &[u8]) -> Option<(u16, String)> {
    let message: LossyMessage = rmp_serde::from_slice(bytes).ok()?;
    let header = message.hdr?;
    Some((header.proto?, header.typ.unwrap_or_default()))
}

/// Structured body of an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable description, never empty.
    pub err: String,
    /// Namespace of the offending message.
    #[serde(rename = "msgproto", default, skip_serializing_if = "Option::is_none")]
    pub msg_proto: Option<u16>,
    /// Type of the offending message.
    #[serde(rename = "msgtype", default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
}

impl ErrorBody {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
