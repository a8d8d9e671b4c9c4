//! In-process transport.
//!
//! [`MemoryConnector`] hands the supervisor channels whose far ends surface
//! on a [`MemoryBackend`] as [`MemoryPeer`]s. Used to drive the agent without
//! a network, and to simulate outages.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protocol::ProtocolMessage;
use tokio::sync::{mpsc, Mutex};

use super::{Channel, Connector, NetworkError};

const CHANNEL_CAPACITY: usize = 256;

struct Shared {
    available: AtomicBool,
    attempts: AtomicU64,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// The remote side of in-process connections.
pub struct MemoryBackend {
    shared: Arc<Shared>,
    incoming: Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

impl MemoryBackend {
    /// Create a backend, initially accepting connections, and a connector
    /// for it.
    pub fn new() -> (Self, MemoryConnector) {
        let (peers, incoming) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            available: AtomicBool::new(true),
            attempts: AtomicU64::new(0),
            peers,
        });
        let connector = MemoryConnector {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                shared,
                incoming: Mutex::new(incoming),
            },
            connector,
        )
    }

    /// Refuse (false) or accept (true) new connections.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.incoming.lock().await.recv().await
    }

    /// Wait up to `timeout` for the next connection.
    pub async fn accept_timeout(&self, timeout: Duration) -> Option<MemoryPeer> {
        tokio::time::timeout(timeout, self.accept()).await.ok().flatten()
    }
}

/// Connector half of a [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Channel, NetworkError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectFailed("backend unavailable".to_string()));
        }

        let (to_peer, from_agent) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_agent, from_peer) = mpsc::channel(CHANNEL_CAPACITY);
        self.shared
            .peers
            .send(MemoryPeer {
                tx: to_agent,
                rx: from_agent,
            })
            .map_err(|_| NetworkError::ConnectFailed("backend dropped".to_string()))?;

        Ok(Channel {
            outbound: to_peer,
            inbound: from_peer,
        })
    }
}

/// The backend's end of one connection. Dropping it severs the connection.
pub struct MemoryPeer {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl MemoryPeer {
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), NetworkError> {
        self.tx
            .send(bytes)
            .await
            .map_err(|_| NetworkError::ConnectionClosed("agent went away".to_string()))
    }

    pub async fn send(&self, message: &ProtocolMessage) -> Result<(), NetworkError> {
        let bytes = message
            .encode()
            .map_err(|e| NetworkError::ConnectionClosed(e.to_string()))?;
        self.send_raw(bytes).await
    }

    pub async fn recv_raw(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Next decodable message, skipping anything that fails to decode.
    pub async fn recv(&mut self) -> Option<ProtocolMessage> {
        loop {
            let bytes = self.rx.recv().await?;
            if let Ok(message) = ProtocolMessage::decode(&bytes) {
                return Some(message);
            }
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<ProtocolMessage> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }
}
