//! Message router for one connection.
//!
//! Decodes inbound protocol messages, dispatches them to the connection's
//! [`SessionRegistry`], and writes replies and session output to the outbound
//! channel. Inbound messages are handled one at a time in arrival order.

use std::sync::Arc;

use protocol::messages::{props, proto, typ};
use protocol::{
    decode_header_lossy, ProtocolError, ProtocolMessage, Status, MSG_BODY_SHELL_STARTED,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::session::{OutputChunk, SessionError, SessionId, SessionRegistry};

/// Result type for router operations: an optional reply to send.
pub type RouterResult = Result<Option<ProtocolMessage>, RouterError>;

/// Errors that can occur during message routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session operation failed.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// The message could not be decoded.
    #[error("malformed message: {0}")]
    Protocol(#[from] ProtocolError),

    /// The namespace is known but the type is not.
    #[error("unknown message type {typ:?} in proto {proto}")]
    UnknownType { proto: u16, typ: String },

    /// The namespace is not handled by this agent.
    #[error("unsupported proto type {0}")]
    UnknownProto(u16),

    /// A required property is absent or has the wrong type.
    #[error("missing or invalid property: {0}")]
    MissingProperty(&'static str),

    /// The connection's outbound channel is gone.
    #[error("outbound channel closed")]
    ChannelClosed,
}

impl RouterError {
    /// Build the `status=error` reply for a failed request.
    ///
    /// Session failures carry their message as a plain-text body so operators
    /// can match on it; everything else gets a structured error body.
    pub fn to_reply(&self, request_proto: u16, request_typ: &str, session_id: Option<&str>) -> ProtocolMessage {
        let reply = match self {
            RouterError::Session(e) => {
                let body = if request_typ == typ::SPAWN {
                    format!("failed to start shell: {e}")
                } else {
                    e.to_string()
                };
                ProtocolMessage::new(request_proto, request_typ)
                    .with_status(Status::Error)
                    .with_body(body.into_bytes())
            }
            other => ProtocolMessage::error_reply(request_proto, request_typ, other),
        };
        match session_id {
            Some(id) => reply.with_session_id(id),
            None => reply,
        }
    }
}

/// Dispatches one connection's messages.
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    outbound: mpsc::Sender<Vec<u8>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            registry,
            outbound,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handle one inbound wire message.
    ///
    /// Every failure is answered on the outbound channel; only a closed
    /// channel is returned as an error.
    pub async fn handle(&self, bytes: &[u8]) -> Result<(), RouterError> {
        let message = match ProtocolMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                let (request_proto, request_typ) =
                    decode_header_lossy(bytes).unwrap_or((proto::INVALID, String::new()));
                warn!(proto = request_proto, typ = %request_typ, error = %e, "Failed to decode message");
                let reply = RouterError::from(e).to_reply(request_proto, &request_typ, None);
                return self.send(&reply).await;
            }
        };

        match self.route(&message).await {
            Ok(Some(reply)) => self.send(&reply).await,
            Ok(None) => Ok(()),
            Err(RouterError::ChannelClosed) => Err(RouterError::ChannelClosed),
            Err(e) => {
                debug!(proto = message.proto(), typ = %message.typ(), error = %e, "Request failed");
                let reply = e.to_reply(message.proto(), message.typ(), message.session_id());
                self.send(&reply).await
            }
        }
    }

    /// Dispatch a decoded message.
    pub async fn route(&self, message: &ProtocolMessage) -> RouterResult {
        debug!(proto = message.proto(), typ = %message.typ(), session_id = ?message.session_id(), "Routing message");

        match message.proto() {
            proto::SHELL => match message.typ() {
                typ::SPAWN => self.handle_spawn(message).await,
                typ::SHELL_COMMAND => self.handle_input(message).await,
                typ::STOP => self.handle_stop(message).await,
                typ::RESIZE => self.handle_resize(message).await,
                other => Err(RouterError::UnknownType {
                    proto: proto::SHELL,
                    typ: other.to_string(),
                }),
            },
            proto::CONTROL => match message.typ() {
                typ::PING => Ok(Some(
                    ProtocolMessage::new(proto::CONTROL, typ::PONG).with_body(message.body.clone()),
                )),
                typ::PONG => Ok(None),
                other => Err(RouterError::UnknownType {
                    proto: proto::CONTROL,
                    typ: other.to_string(),
                }),
            },
            other => Err(RouterError::UnknownProto(other)),
        }
    }

    async fn handle_spawn(&self, message: &ProtocolMessage) -> RouterResult {
        let size = match (
            message.property_u16(props::TERMINAL_WIDTH),
            message.property_u16(props::TERMINAL_HEIGHT),
        ) {
            (Some(cols), Some(rows)) if cols > 0 && rows > 0 => Some((cols, rows)),
            _ => None,
        };

        let spawned = self.registry.spawn(size).await?;
        info!(session_id = %spawned.id, "Shell started for operator");

        // the start reply goes out before any output
        let reply = ProtocolMessage::new(proto::SHELL, typ::SPAWN)
            .with_status(Status::Normal)
            .with_session_id(&spawned.id)
            .with_body(MSG_BODY_SHELL_STARTED);
        self.send(&reply).await?;

        self.tasks.spawn(pump_output(
            spawned.id,
            spawned.output,
            Arc::clone(&self.registry),
            self.outbound.clone(),
            self.cancel.child_token(),
        ));
        Ok(None)
    }

    async fn handle_input(&self, message: &ProtocolMessage) -> RouterResult {
        let id = message.session_id().unwrap_or_default();
        self.registry.write(id, &message.body).await?;
        Ok(None)
    }

    async fn handle_stop(&self, message: &ProtocolMessage) -> RouterResult {
        let id = message.session_id().unwrap_or_default();
        let status = self.registry.stop(id).await?;
        info!(session_id = %id, status = ?status, "Shell stopped by operator");

        Ok(Some(
            ProtocolMessage::response_to(message).with_status(Status::Normal),
        ))
    }

    async fn handle_resize(&self, message: &ProtocolMessage) -> RouterResult {
        let id = message.session_id().unwrap_or_default();
        let cols = message
            .property_u16(props::TERMINAL_WIDTH)
            .ok_or(RouterError::MissingProperty(props::TERMINAL_WIDTH))?;
        let rows = message
            .property_u16(props::TERMINAL_HEIGHT)
            .ok_or(RouterError::MissingProperty(props::TERMINAL_HEIGHT))?;

        self.registry.resize(id, cols, rows).await?;
        Ok(None)
    }

    async fn send(&self, message: &ProtocolMessage) -> Result<(), RouterError> {
        let bytes = message.encode()?;
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| RouterError::ChannelClosed)
    }

    /// Stop output pumps, then the session.
    ///
    /// Pumps go first: a pump stuck on a dead connection would otherwise keep
    /// the live queue full and hold up the shell's reader.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.registry.shutdown().await;
    }
}

/// Forward live output until the session ends, then report a shell that
/// exited on its own.
async fn pump_output(
    id: SessionId,
    mut output: mpsc::Receiver<OutputChunk>,
    registry: Arc<SessionRegistry>,
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = output.recv() => chunk,
        };
        let Some(chunk) = chunk else { break };

        let message = ProtocolMessage::new(proto::SHELL, typ::SHELL_COMMAND)
            .with_status(Status::Normal)
            .with_session_id(&id)
            .with_body(chunk.data.to_vec());
        let Ok(bytes) = message.encode() else {
            continue;
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => return,
            sent = outbound.send(bytes) => sent,
        };
        if sent.is_err() {
            return;
        }
    }

    if registry.reap(&id).await {
        info!(session_id = %id, "Shell exited, notifying operator");
        let stop = ProtocolMessage::new(proto::SHELL, typ::STOP)
            .with_status(Status::Normal)
            .with_session_id(&id);
        if let Ok(bytes) = stop.encode() {
            let _ = outbound.send(bytes).await;
        }
    }
}
