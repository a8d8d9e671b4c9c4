//! End-to-end integration tests for the DevTerm agent.
//!
//! These drive a real supervisor, router and shell through the in-memory
//! transport, playing the backend's part:
//! - Shell session lifecycle as seen by an operator
//! - Error replies for malformed requests
//! - Recording and playback of a session
//! - Reconnecting after transport loss, and waiting for a late dependency

use std::sync::Arc;
use std::time::Duration;

use agent::network::{
    BackoffPolicy, ConnectionState, ConnectionSupervisor, MemoryBackend, MemoryPeer,
    SupervisorSettings, UnixSocketProbe,
};
use agent::playback::{PlaybackError, PlaybackService};
use agent::recording::{MemoryRecordingStore, RecorderSettings, RecordingSink, RecordingStore};
use agent::session::{EchoMode, ShellSpec};
use protocol::messages::{proto, typ};
use protocol::{ErrorBody, ProtocolMessage, Status};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::watch;

const STEP: Duration = Duration::from_secs(10);

fn backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(50),
        multiplier: 2.0,
        jitter: 0.0,
        max_attempts: None,
    }
}

fn settings(recording: Option<RecordingSink>) -> SupervisorSettings {
    SupervisorSettings {
        backoff: backoff(),
        dependency_poll: Duration::from_millis(20),
        shell: ShellSpec {
            command: "/bin/sh".to_string(),
            ..ShellSpec::default()
        },
        recording,
    }
}

fn recording_sink(store: &Arc<MemoryRecordingStore>) -> RecordingSink {
    let store: Arc<dyn RecordingStore> = store.clone();
    RecordingSink::new(
        store,
        RecorderSettings {
            flush_interval: Duration::from_millis(20),
            flush_threshold_bytes: 1024,
        },
    )
}

async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, wanted: ConnectionState) {
    tokio::time::timeout(STEP, rx.wait_for(|s| *s == wanted))
        .await
        .expect("connection state not reached")
        .expect("supervisor dropped");
}

/// Operator side of one connection.
struct Operator {
    peer: MemoryPeer,
    /// Shell output collected while waiting for other replies.
    output: Vec<u8>,
}

impl Operator {
    fn new(peer: MemoryPeer) -> Self {
        Self {
            peer,
            output: Vec::new(),
        }
    }

    async fn send(&self, message: ProtocolMessage) {
        self.peer.send(&message).await.expect("agent went away");
    }

    async fn next(&mut self) -> ProtocolMessage {
        self.peer.recv_timeout(STEP).await.expect("no reply from agent")
    }

    /// Next message that is not shell output. Output seen on the way is kept.
    async fn reply(&mut self) -> ProtocolMessage {
        loop {
            let msg = self.next().await;
            let is_output = msg.proto() == proto::SHELL
                && msg.typ() == typ::SHELL_COMMAND
                && msg.status() == Some(Status::Normal);
            if is_output {
                self.output.extend_from_slice(&msg.body);
                continue;
            }
            return msg;
        }
    }

    async fn spawn(&mut self) -> ProtocolMessage {
        self.send(ProtocolMessage::new(proto::SHELL, typ::SPAWN)).await;
        self.reply().await
    }

    async fn input(&self, session_id: &str, line: &str) {
        self.send(
            ProtocolMessage::new(proto::SHELL, typ::SHELL_COMMAND)
                .with_session_id(session_id)
                .with_body(line.as_bytes().to_vec()),
        )
        .await;
    }

    async fn stop(&mut self, session_id: &str) -> ProtocolMessage {
        self.send(ProtocolMessage::new(proto::SHELL, typ::STOP).with_session_id(session_id))
            .await;
        self.reply().await
    }

    /// Collect shell output until `needle` shows up in it.
    async fn read_until(&mut self, needle: &str) {
        while !String::from_utf8_lossy(&self.output).contains(needle) {
            let msg = self.next().await;
            assert_eq!(msg.typ(), typ::SHELL_COMMAND, "unexpected {msg:?}");
            self.output.extend_from_slice(&msg.body);
        }
    }

    /// Collect shell output until it ends with a shell prompt (`$ ` or `# `
    /// for root).
    async fn read_prompt(&mut self) {
        while !ends_with_prompt(&self.output) {
            let msg = self.next().await;
            assert_eq!(msg.typ(), typ::SHELL_COMMAND, "unexpected {msg:?}");
            self.output.extend_from_slice(&msg.body);
        }
    }

    /// Collect whatever output is still in flight.
    async fn drain_output(&mut self) {
        while let Some(msg) = self.peer.recv_timeout(Duration::from_millis(300)).await {
            if msg.typ() == typ::SHELL_COMMAND {
                self.output.extend_from_slice(&msg.body);
            }
        }
    }
}

fn ends_with_prompt(output: &[u8]) -> bool {
    output.ends_with(b"$ ") || output.ends_with(b"# ")
}

// =============================================================================
// Session Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_operator_session_lifecycle() {
    let (backend, connector) = MemoryBackend::new();
    let supervisor = ConnectionSupervisor::new(connector, UnixSocketProbe::default(), settings(None));
    supervisor.start().unwrap();
    let mut op = Operator::new(backend.accept_timeout(STEP).await.unwrap());

    // spawn
    let started = op.spawn().await;
    assert_eq!(started.typ(), typ::SPAWN);
    assert_eq!(started.status(), Some(Status::Normal));
    assert_eq!(started.body, b"Shell started");
    let id = started.session_id().unwrap().to_string();
    op.read_prompt().await;

    // a second spawn on the same connection is refused
    let refused = op.spawn().await;
    assert_eq!(refused.typ(), typ::SPAWN);
    assert_eq!(refused.status(), Some(Status::Error));
    assert_eq!(refused.body, b"failed to start shell: shell is already running");

    // input reaches the shell
    op.input(&id, "ls /\n").await;
    op.read_until("tmp").await;

    // stop
    let stopped = op.stop(&id).await;
    assert_eq!(stopped.typ(), typ::STOP);
    assert_eq!(stopped.status(), Some(Status::Normal));
    assert_eq!(stopped.session_id(), Some(id.as_str()));

    // stopping again finds nothing
    let again = op.stop(&id).await;
    assert_eq!(again.status(), Some(Status::Error));
    assert!(String::from_utf8_lossy(&again.body).contains("session not found"));

    // input after stop is refused
    op.input(&id, "echo too late\n").await;
    let late = op.reply().await;
    assert_eq!(late.typ(), typ::SHELL_COMMAND);
    assert_eq!(late.status(), Some(Status::Error));

    // a new shell can be started afterwards, under a new id
    let restarted = op.spawn().await;
    assert_eq!(restarted.status(), Some(Status::Normal));
    let new_id = restarted.session_id().unwrap().to_string();
    assert_ne!(new_id, id);
    op.output.clear();
    // the new shell greets the operator with its own prompt
    op.read_prompt().await;
    op.input(&new_id, "printf 'fresh%s\\n' _shell\n").await;
    op.read_until("fresh_shell").await;

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_requests_get_error_replies() {
    let (backend, connector) = MemoryBackend::new();
    let supervisor = ConnectionSupervisor::new(connector, UnixSocketProbe::default(), settings(None));
    supervisor.start().unwrap();
    let mut op = Operator::new(backend.accept_timeout(STEP).await.unwrap());

    op.send(ProtocolMessage::new(proto::SHELL, "bogus")).await;
    let reply = op.reply().await;
    assert_eq!((reply.proto(), reply.typ()), (proto::SHELL, "bogus"));
    assert_eq!(reply.status(), Some(Status::Error));
    let body = ErrorBody::decode(&reply.body).unwrap();
    assert_eq!(body.msg_type.as_deref(), Some("bogus"));

    op.send(ProtocolMessage::new(0x7777, typ::SPAWN)).await;
    let reply = op.reply().await;
    assert_eq!((reply.proto(), reply.typ()), (0x7777, typ::SPAWN));
    assert_eq!(reply.status(), Some(Status::Error));
    let body = ErrorBody::decode(&reply.body).unwrap();
    assert_eq!(body.msg_proto, Some(0x7777));

    // undecodable bytes do not take the connection down
    op.peer.send_raw(b"\xc1garbage".to_vec()).await.unwrap();
    let reply = op.reply().await;
    assert_eq!(reply.status(), Some(Status::Error));

    op.send(ProtocolMessage::new(proto::CONTROL, typ::PING)).await;
    assert_eq!(op.reply().await.typ(), typ::PONG);

    supervisor.shutdown().await.unwrap();
}

// =============================================================================
// Recording and Playback Tests
// =============================================================================

#[tokio::test]
async fn test_playback_matches_live_output_across_echo_changes() {
    let store = Arc::new(MemoryRecordingStore::new());
    let (backend, connector) = MemoryBackend::new();
    let supervisor = ConnectionSupervisor::new(
        connector,
        UnixSocketProbe::default(),
        settings(Some(recording_sink(&store))),
    );
    supervisor.start().unwrap();
    let mut op = Operator::new(backend.accept_timeout(STEP).await.unwrap());

    let id = op.spawn().await.session_id().unwrap().to_string();
    op.read_prompt().await;

    // echo on: the typed command comes back before its output
    op.input(&id, "echo 'now you see me'\n").await;
    op.read_until("now you see me\r\n").await;
    op.read_prompt().await;

    op.input(&id, "stty -echo; printf 'ECHO%s\\n' OFF\n").await;
    op.read_until("ECHOOFF").await;
    op.read_prompt().await;
    op.input(&id, "printf 'hidden%s\\n' _typing\n").await;
    op.read_until("hidden_typing").await;
    op.read_prompt().await;
    op.input(&id, "stty echo; printf 'ECHO%s\\n' ON\n").await;
    op.read_until("ECHOON").await;
    op.read_prompt().await;

    // echo back on: keystrokes are visible again
    op.input(&id, "echo 'and now echo is back on'\n").await;
    op.read_until("and now echo is back on\r\n").await;
    op.read_prompt().await;

    assert_eq!(op.stop(&id).await.status(), Some(Status::Normal));
    op.drain_output().await;
    assert!(store.is_sealed(&id));

    let playback = PlaybackService::new(store.clone());
    let chunks = playback.load(&id).await.unwrap();
    let replayed: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
    assert_eq!(replayed, op.output);

    // keystrokes typed while echo was off appear in neither stream
    let text = String::from_utf8_lossy(&replayed);
    assert!(text.contains("hidden_typing"));
    assert!(!text.contains("printf 'hidden"));

    // keystrokes typed while echo was on appear in both, ahead of their output
    for typed in ["echo 'now you see me'", "echo 'and now echo is back on'"] {
        let output = typed.trim_start_matches("echo '").trim_end_matches('\'');
        let typed_at = text.find(typed).unwrap_or_else(|| panic!("{typed:?} not echoed"));
        let output_at = text.rfind(&format!("{output}\r\n")).unwrap();
        assert!(typed_at < output_at);
    }
    let live = String::from_utf8_lossy(&op.output);
    assert!(live.contains("echo 'now you see me'"));
    assert!(live.contains("echo 'and now echo is back on'"));

    // sequence numbers are dense and timestamps never go backwards
    for (i, pair) in chunks.windows(2).enumerate() {
        assert_eq!(pair[0].seq, i as u64);
        assert!(pair[0].at_ms <= pair[1].at_ms);
    }

    let echo_of = |needle: &str| {
        chunks
            .iter()
            .find(|c| String::from_utf8_lossy(&c.data).contains(needle))
            .map(|c| c.echo)
    };
    assert_eq!(echo_of("hidden_typing"), Some(EchoMode::Disabled));
    assert!(echo_of("ECHOON").is_some());

    // paced streaming delivers the same chunks
    let mut stream = playback.open(&id, Duration::ZERO).await.unwrap();
    let mut streamed = Vec::new();
    while let Some(chunk) = stream.next().await {
        streamed.extend_from_slice(&chunk.data);
    }
    assert_eq!(streamed, replayed);

    assert!(matches!(
        playback.load("no-such-session").await,
        Err(PlaybackError::NotFound(_))
    ));

    supervisor.shutdown().await.unwrap();
}

// =============================================================================
// Connection Supervision Tests
// =============================================================================

#[tokio::test]
async fn test_transport_loss_and_late_dependency() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("dependency.sock");
    let store = Arc::new(MemoryRecordingStore::new());

    let (backend, connector) = MemoryBackend::new();
    let supervisor = ConnectionSupervisor::new(
        connector,
        UnixSocketProbe::new(Some(socket.clone())),
        settings(Some(recording_sink(&store))),
    );
    let mut state = supervisor.subscribe();
    supervisor.start().unwrap();

    // no connection attempt until the dependency shows up
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.attempts(), 0);
    assert_ne!(supervisor.state(), ConnectionState::Connected);

    let _dependency = UnixListener::bind(&socket).unwrap();
    let mut op = Operator::new(backend.accept_timeout(STEP).await.unwrap());
    wait_state(&mut state, ConnectionState::Connected).await;

    let id = op.spawn().await.session_id().unwrap().to_string();
    op.input(&id, "echo before_loss\n").await;
    op.read_until("before_loss").await;

    // the transport drops; the session goes with it and the agent reconnects
    drop(op);
    let mut op = Operator::new(backend.accept_timeout(STEP).await.unwrap());
    wait_state(&mut state, ConnectionState::Connected).await;
    assert!(store.is_sealed(&id));

    // the old session is gone, and the new connection can start its own
    let gone = op.stop(&id).await;
    assert_eq!(gone.status(), Some(Status::Error));
    let fresh = op.spawn().await;
    assert_eq!(fresh.status(), Some(Status::Normal));
    assert_ne!(fresh.session_id(), Some(id.as_str()));

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refused_connections_are_retried() {
    let (backend, connector) = MemoryBackend::new();
    backend.set_available(false);
    let supervisor = ConnectionSupervisor::new(connector, UnixSocketProbe::default(), settings(None));
    let mut state = supervisor.subscribe();
    supervisor.start().unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(backend.attempts() >= 2);
    assert_ne!(supervisor.state(), ConnectionState::Connected);

    backend.set_available(true);
    let mut op = Operator::new(backend.accept_timeout(STEP).await.unwrap());
    wait_state(&mut state, ConnectionState::Connected).await;

    op.send(ProtocolMessage::new(proto::CONTROL, typ::PING)).await;
    assert_eq!(op.reply().await.typ(), typ::PONG);

    supervisor.shutdown().await.unwrap();
}
