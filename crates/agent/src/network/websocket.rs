//! WebSocket transport to the remote backend.
//!
//! Each connection gets one driver task that owns the socket: it forwards
//! binary frames between the socket and the channel halves and keeps the
//! connection alive with ping/pong heartbeats. Its read and write halves make
//! progress independently.

use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{Channel, Connector, NetworkError};
use crate::config::ServerConfig;

const CHANNEL_CAPACITY: usize = 256;

/// Settings for [`WebSocketConnector`].
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` when set.
    pub token: Option<String>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }
}

impl From<&ServerConfig> for WebSocketConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            url: config.url.clone(),
            token: config.token.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
        }
    }
}

/// Connects to the backend over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }
}

impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Channel, NetworkError> {
        let url = Url::parse(&self.config.url)
            .map_err(|e| NetworkError::InvalidUrl(format!("{}: {e}", self.config.url)))?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| NetworkError::InvalidUrl(e.to_string()))?;
        if let Some(token) = &self.config.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| NetworkError::ConnectFailed(format!("invalid token: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        tracing::info!(url = %url, "Connecting to server");

        let (ws, _) = connect_async(request).await.map_err(|e| match e {
            WsError::Io(io) => NetworkError::ConnectFailed(io.to_string()),
            other => NetworkError::ConnectFailed(other.to_string()),
        })?;

        let (outbound, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(drive(
            ws,
            outbound_rx,
            inbound_tx,
            self.config.heartbeat_interval,
            self.config.heartbeat_timeout,
        ));

        Ok(Channel { outbound, inbound })
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// When the peer was last heard from. `None` while the reader is stalled
/// handing a frame to a full inbound queue: the peer is not at fault then,
/// and its pongs sit unread in the socket.
type PeerSeen = Option<Instant>;

/// Pump frames until either side goes away or heartbeats stop.
///
/// Reading and writing run as separate halves, so a full inbound queue
/// never holds up outbound frames or heartbeats.
async fn drive(
    ws: WsStream,
    outbound: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<Vec<u8>>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
) {
    let (mut sink, stream) = ws.split();
    let (seen_tx, seen_rx) = watch::channel::<PeerSeen>(Some(Instant::now()));

    let reason = tokio::select! {
        reason = read_half(stream, inbound, seen_tx) => reason,
        reason = write_half(&mut sink, outbound, seen_rx, heartbeat_interval, heartbeat_timeout) => reason,
    };

    if matches!(reason, NetworkError::ConnectionClosed(ref why) if why == LOCAL_CLOSE) {
        let _ = sink.close().await;
    }
    tracing::info!(reason = %reason, "WebSocket connection ended");
}

const LOCAL_CLOSE: &str = "closed locally";

async fn read_half(
    mut stream: SplitStream<WsStream>,
    inbound: mpsc::Sender<Vec<u8>>,
    seen: watch::Sender<PeerSeen>,
) -> NetworkError {
    loop {
        let frame = stream.next().await;
        seen.send_replace(Some(Instant::now()));
        match frame {
            Some(Ok(WsMessage::Binary(bytes))) => {
                seen.send_replace(None);
                if inbound.send(bytes).await.is_err() {
                    return NetworkError::ConnectionClosed(LOCAL_CLOSE.to_string());
                }
                seen.send_replace(Some(Instant::now()));
            }
            Some(Ok(WsMessage::Pong(_))) => tracing::trace!("Received heartbeat pong"),
            Some(Ok(WsMessage::Close(frame))) => {
                return NetworkError::ConnectionClosed(format!("server closed connection: {frame:?}"));
            }
            Some(Ok(WsMessage::Text(text))) => {
                tracing::warn!(len = text.len(), "Ignoring text frame from server");
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return NetworkError::ConnectionClosed(e.to_string()),
            None => return NetworkError::ConnectionClosed("stream ended".to_string()),
        }
    }
}

async fn write_half(
    sink: &mut SplitSink<WsStream, WsMessage>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    seen: watch::Receiver<PeerSeen>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
) -> NetworkError {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    // the first tick fires immediately
    heartbeat.tick().await;

    loop {
        tokio::select! {
            bytes = outbound.recv() => {
                let Some(bytes) = bytes else {
                    return NetworkError::ConnectionClosed(LOCAL_CLOSE.to_string());
                };
                if let Err(e) = sink.send(WsMessage::Binary(bytes)).await {
                    return NetworkError::ConnectionClosed(e.to_string());
                }
            }
            _ = heartbeat.tick() => {
                let silent = (*seen.borrow()).map(|at| at.elapsed());
                if let Some(silent) = silent.filter(|s| *s > heartbeat_interval + heartbeat_timeout) {
                    return NetworkError::HeartbeatTimeout(silent);
                }
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                    return NetworkError::ConnectionClosed(e.to_string());
                }
                tracing::trace!("Sent heartbeat ping");
            }
        }
    }
}
