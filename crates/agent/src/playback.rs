//! Playback of sealed session recordings.
//!
//! [`PlaybackService`] turns a sealed recording back into an ordered stream of
//! chunks, optionally paced. [`PlaybackServer`] exposes it over WebSocket at
//! `/playback/{session_id}?sleep_ms=N`, one binary protocol message per chunk.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::messages::{proto, typ};
use protocol::{FrameCodec, ProtocolMessage, Status};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::recording::{decode_log, RecordedChunk, RecordingStore, StoreError};
use crate::session::SessionId;

/// Errors raised while loading or serving a recording.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// No sealed recording exists for this session.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("recording store error: {0}")]
    Store(#[from] StoreError),

    #[error("playback server error: {0}")]
    Server(String),
}

/// Summary of a playable recording.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RecordingSummary {
    pub session_id: SessionId,
    pub size_bytes: u64,
    pub chunks: usize,
}

/// Ordered chunks of one recording, delivered at the requested pace.
pub struct PlaybackStream {
    session_id: SessionId,
    total: usize,
    rx: mpsc::Receiver<RecordedChunk>,
}

impl PlaybackStream {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Number of chunks the stream will yield in total.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Next chunk, or `None` once the recording is exhausted.
    pub async fn next(&mut self) -> Option<RecordedChunk> {
        self.rx.recv().await
    }
}

/// Reads sealed recordings out of a store.
pub struct PlaybackService {
    store: Arc<dyn RecordingStore>,
    codec: FrameCodec,
}

impl PlaybackService {
    pub fn new(store: Arc<dyn RecordingStore>) -> Self {
        Self {
            store,
            codec: FrameCodec::new(),
        }
    }

    /// Load every chunk of a sealed recording.
    pub async fn load(&self, session_id: &str) -> Result<Vec<RecordedChunk>, PlaybackError> {
        let store = Arc::clone(&self.store);
        let codec = self.codec.clone();
        let key = session_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<RecordedChunk>, PlaybackError> {
            let bytes = store.read(&key).map_err(|e| match e {
                StoreError::NotFound(_) | StoreError::InvalidKey(_) => {
                    PlaybackError::NotFound(key.clone())
                }
                other => PlaybackError::Store(other),
            })?;
            Ok(decode_log(&codec, &key, &bytes)?)
        })
        .await
        .map_err(|e| PlaybackError::Server(e.to_string()))?
    }

    /// Open a recording for playback.
    ///
    /// With zero `pacing` chunks are yielded back to back; otherwise the
    /// stream waits `pacing` before every chunk after the first.
    pub async fn open(&self, session_id: &str, pacing: Duration) -> Result<PlaybackStream, PlaybackError> {
        let chunks = self.load(session_id).await?;
        let total = chunks.len();
        let (tx, rx) = mpsc::channel(64);

        tracing::debug!(session_id = %session_id, chunks = total, pacing_ms = pacing.as_millis() as u64, "Opened recording");

        tokio::spawn(async move {
            for (i, chunk) in chunks.into_iter().enumerate() {
                if i > 0 && !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(PlaybackStream {
            session_id: session_id.to_string(),
            total,
            rx,
        })
    }

    /// List playable recordings.
    pub async fn list(&self) -> Result<Vec<RecordingSummary>, PlaybackError> {
        let store = Arc::clone(&self.store);
        let infos = tokio::task::spawn_blocking(move || store.list())
            .await
            .map_err(|e| PlaybackError::Server(e.to_string()))??;

        let mut summaries = Vec::with_capacity(infos.len());
        for info in infos {
            let chunks = match self.load(&info.key).await {
                Ok(chunks) => chunks.len(),
                Err(e) => {
                    tracing::warn!(recording = %info.key, error = %e, "Skipping unreadable recording");
                    continue;
                }
            };
            summaries.push(RecordingSummary {
                session_id: info.key,
                size_bytes: info.size_bytes,
                chunks,
            });
        }
        Ok(summaries)
    }
}

/// A parsed `/playback/{session_id}?sleep_ms=N` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRequest {
    pub session_id: SessionId,
    pub pacing: Duration,
}

impl PlaybackRequest {
    /// Parse a request target (path and query).
    pub fn parse(target: &str) -> Option<Self> {
        let url = Url::parse("ws://playback.invalid").ok()?.join(target).ok()?;
        let mut segments = url.path_segments()?;
        if segments.next()? != "playback" {
            return None;
        }
        let session_id = segments.next().filter(|s| !s.is_empty())?.to_string();
        if segments.next().is_some() {
            return None;
        }

        let sleep_ms = match url.query_pairs().find(|(k, _)| k == "sleep_ms") {
            Some((_, v)) => v.parse::<u64>().ok()?,
            None => 0,
        };

        Some(Self {
            session_id,
            pacing: Duration::from_millis(sleep_ms),
        })
    }
}

/// WebSocket front end for [`PlaybackService`].
pub struct PlaybackServer {
    listener: TcpListener,
    service: Arc<PlaybackService>,
    linger: Duration,
}

impl PlaybackServer {
    pub async fn bind(
        addr: &str,
        service: Arc<PlaybackService>,
        linger: Duration,
    ) -> Result<Self, PlaybackError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PlaybackError::Server(format!("failed to bind {addr}: {e}")))?;
        Ok(Self {
            listener,
            service,
            linger,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, PlaybackError> {
        self.listener
            .local_addr()
            .map_err(|e| PlaybackError::Server(e.to_string()))
    }

    /// Accept connections until `cancel` fires, then wait for open
    /// connections to wind down.
    pub async fn run(self, cancel: CancellationToken) {
        let tracker = TaskTracker::new();
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(addr = %addr, "Playback server listening");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let service = Arc::clone(&self.service);
                        let linger = self.linger;
                        let cancel = cancel.child_token();
                        tracker.spawn(async move {
                            if let Err(e) = serve_connection(stream, service, linger, cancel).await {
                                tracing::debug!(peer = %peer, error = %e, "Playback connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept playback connection");
                    }
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!("Playback server stopped");
    }
}

async fn serve_connection(
    stream: TcpStream,
    service: Arc<PlaybackService>,
    linger: Duration,
    cancel: CancellationToken,
) -> Result<(), PlaybackError> {
    let mut parsed = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let target = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        match PlaybackRequest::parse(target) {
            Some(req) => {
                parsed = Some(req);
                Ok(response)
            }
            None => {
                let mut error = ErrorResponse::new(Some("expected /playback/{session_id}".to_string()));
                *error.status_mut() = StatusCode::NOT_FOUND;
                Err(error)
            }
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| PlaybackError::Server(format!("handshake failed: {e}")))?;
    let Some(request) = parsed else {
        return Ok(());
    };
    let (mut sink, mut incoming) = ws.split();

    let mut stream = match service.open(&request.session_id, request.pacing).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::info!(session_id = %request.session_id, error = %e, "Playback request rejected");
            let reply = ProtocolMessage::error_reply(proto::SHELL, typ::ERROR, &e)
                .with_session_id(&request.session_id);
            let _ = sink.send(to_ws(&reply)?).await;
            let _ = sink.close().await;
            return Ok(());
        }
    };

    tracing::info!(
        session_id = %request.session_id,
        chunks = stream.len(),
        pacing_ms = request.pacing.as_millis() as u64,
        "Playing back recording"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            chunk = stream.next() => {
                let Some(chunk) = chunk else { break };
                let message = ProtocolMessage::new(proto::SHELL, typ::SHELL_COMMAND)
                    .with_status(Status::Normal)
                    .with_session_id(&request.session_id)
                    .with_body(chunk.data);
                sink.send(to_ws(&message)?)
                    .await
                    .map_err(|e| PlaybackError::Server(e.to_string()))?;
            }
            // a client that hangs up early ends playback
            msg = incoming.next() => match msg {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return Ok(()),
                Some(Ok(_)) => {}
            },
        }
    }

    // no terminator: keep the socket open until the client leaves
    let _ = tokio::time::timeout(linger, async {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = incoming.next() => match msg {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    })
    .await;
    let _ = sink.close().await;
    Ok(())
}

fn to_ws(message: &ProtocolMessage) -> Result<WsMessage, PlaybackError> {
    message
        .encode()
        .map(WsMessage::Binary)
        .map_err(|e| PlaybackError::Server(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{encode_chunk, MemoryRecordingStore};
    use crate::session::EchoMode;
    use std::time::Instant;

    fn recorded(chunks: &[&[u8]]) -> Arc<MemoryRecordingStore> {
        let store = Arc::new(MemoryRecordingStore::new());
        let codec = FrameCodec::new();
        store.create("rec-1").unwrap();
        for (i, data) in chunks.iter().enumerate() {
            let chunk = RecordedChunk {
                seq: i as u64,
                at_ms: i as u64,
                echo: EchoMode::Enabled,
                data: data.to_vec(),
            };
            store.append("rec-1", &encode_chunk(&codec, &chunk).unwrap()).unwrap();
        }
        store.seal("rec-1").unwrap();
        store
    }

    #[tokio::test]
    async fn test_open_yields_chunks_in_order() {
        let service = PlaybackService::new(recorded(&[b"one", b"two", b"three"]));
        let mut stream = service.open("rec-1", Duration::ZERO).await.unwrap();
        assert_eq!(stream.len(), 3);

        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend(chunk.data);
        }
        assert_eq!(out, b"onetwothree");
    }

    #[tokio::test]
    async fn test_pacing_delays_between_chunks() {
        let service = PlaybackService::new(recorded(&[b"a", b"b", b"c"]));
        let mut stream = service.open("rec-1", Duration::from_millis(50)).await.unwrap();

        let start = Instant::now();
        while stream.next().await.is_some() {}
        // two gaps for three chunks
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_unknown_and_unsealed_recordings_not_found() {
        let store = recorded(&[b"x"]);
        store.create("open-one").unwrap();
        let service = PlaybackService::new(store);

        assert!(matches!(
            service.open("missing", Duration::ZERO).await,
            Err(PlaybackError::NotFound(_))
        ));
        assert!(matches!(
            service.open("open-one", Duration::ZERO).await,
            Err(PlaybackError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_reports_chunk_counts() {
        let service = PlaybackService::new(recorded(&[b"a", b"b"]));
        let list = service.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].session_id, "rec-1");
        assert_eq!(list[0].chunks, 2);
    }

    #[test]
    fn test_parse_request() {
        assert_eq!(
            PlaybackRequest::parse("/playback/abc-123?sleep_ms=25"),
            Some(PlaybackRequest {
                session_id: "abc-123".to_string(),
                pacing: Duration::from_millis(25),
            })
        );
        assert_eq!(
            PlaybackRequest::parse("/playback/abc").map(|r| r.pacing),
            Some(Duration::ZERO)
        );
        assert!(PlaybackRequest::parse("/other/abc").is_none());
        assert!(PlaybackRequest::parse("/playback/").is_none());
        assert!(PlaybackRequest::parse("/playback/a/b").is_none());
        assert!(PlaybackRequest::parse("/playback/a?sleep_ms=soon").is_none());
    }

    #[tokio::test]
    async fn test_server_streams_recording() {
        let service = Arc::new(PlaybackService::new(recorded(&[b"hello ", b"world"])));
        let server = PlaybackServer::bind("127.0.0.1:0", service, Duration::from_secs(1))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/playback/rec-1"))
            .await
            .unwrap();
        let mut body = Vec::new();
        for _ in 0..2 {
            let Some(Ok(WsMessage::Binary(bytes))) = ws.next().await else {
                panic!("expected binary frame");
            };
            let msg = ProtocolMessage::decode(&bytes).unwrap();
            assert_eq!(msg.typ(), typ::SHELL_COMMAND);
            assert_eq!(msg.status(), Some(Status::Normal));
            assert_eq!(msg.session_id(), Some("rec-1"));
            body.extend(msg.body);
        }
        assert_eq!(body, b"hello world");
        ws.close(None).await.unwrap();

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_rejects_unknown_recording() {
        let service = Arc::new(PlaybackService::new(Arc::new(MemoryRecordingStore::new())));
        let server = PlaybackServer::bind("127.0.0.1:0", service, Duration::from_secs(1))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/playback/nope"))
            .await
            .unwrap();
        let Some(Ok(WsMessage::Binary(bytes))) = ws.next().await else {
            panic!("expected error frame");
        };
        let msg = ProtocolMessage::decode(&bytes).unwrap();
        assert_eq!(msg.status(), Some(Status::Error));
        let body = protocol::ErrorBody::decode(&msg.body).unwrap();
        assert!(body.err.contains("session not found"));

        cancel.cancel();
        task.await.unwrap();
    }
}
