//! Connectivity to the remote backend.
//!
//! A [`Connector`] produces a duplex [`Channel`] of whole protocol messages;
//! a [`DependencyProbe`] reports whether the local dependency the agent
//! needs is reachable. The [`ConnectionSupervisor`] ties both together with
//! reconnect and backoff.

pub mod dependency;
pub mod memory;
pub mod supervisor;
pub mod websocket;

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

pub use dependency::UnixSocketProbe;
pub use memory::{MemoryBackend, MemoryConnector, MemoryPeer};
pub use supervisor::{
    Backoff, BackoffPolicy, ConnectionState, ConnectionSupervisor, SupervisorError,
    SupervisorSettings,
};
pub use websocket::{WebSocketConfig, WebSocketConnector};

/// Transport and dependency failures. All of them are retried by the
/// supervisor.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The remote end could not be reached.
    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    /// An established connection went away.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The local dependency is not reachable yet.
    #[error("local dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// The remote end stopped answering heartbeats.
    #[error("heartbeat timed out after {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
}

/// One established duplex connection carrying encoded protocol messages.
///
/// `inbound` ends when the connection is lost; sending on `outbound` fails
/// once it is.
pub struct Channel {
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

/// Opens connections to the remote backend.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<Channel, NetworkError>> + Send;
}

/// Readiness check for a local dependency.
pub trait DependencyProbe: Send + Sync + 'static {
    /// Resolves to `Ok` once the dependency answers, or to
    /// [`NetworkError::DependencyUnavailable`].
    fn check(&self) -> impl Future<Output = Result<(), NetworkError>> + Send;
}
