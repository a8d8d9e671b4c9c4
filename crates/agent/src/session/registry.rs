//! Single-occupancy session registry.
//!
//! One registry exists per connection and holds at most one shell session.
//! The slot is a tagged enum behind a `tokio::sync::Mutex`; every state change
//! goes through it.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use super::{
    OutputChunk, PtySession, SessionError, SessionId, SessionStatus, ShellSpec,
    DEFAULT_LIVE_CAPACITY,
};
use crate::recording::{RecorderHandle, RecordingSink, SessionRecorder};

/// Observable state of the registry slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Absent,
    Starting,
    Running(SessionId),
    Stopped(SessionId),
}

/// A freshly started session and its live output stream.
pub struct SpawnedSession {
    pub id: SessionId,
    /// Live output. Flow-controlled: the shell is throttled while this queue
    /// is full. Ends when the shell exits or the session is stopped.
    pub output: mpsc::Receiver<OutputChunk>,
}

struct RunningSession {
    session: Arc<PtySession>,
    recorder: Option<RecorderHandle>,
}

impl RunningSession {
    /// Terminate the shell and wait for its recording to be sealed.
    async fn finish(self) -> Result<SessionStatus, SessionError> {
        let status = self.session.terminate().await;
        if let Some(recorder) = self.recorder {
            let stats = recorder.finish().await;
            tracing::debug!(
                session_id = %self.session.id(),
                chunks = stats.chunks,
                sealed = stats.sealed,
                "Recorder finished"
            );
        }
        status
    }
}

enum Slot {
    Absent,
    Starting,
    Running(RunningSession),
    Stopped { id: SessionId },
}

impl Slot {
    fn state(&self) -> SlotState {
        match self {
            Slot::Absent => SlotState::Absent,
            Slot::Starting => SlotState::Starting,
            Slot::Running(running) => SlotState::Running(running.session.id().clone()),
            Slot::Stopped { id } => SlotState::Stopped(id.clone()),
        }
    }

    fn running(&self, id: &str) -> Option<&Arc<PtySession>> {
        match self {
            Slot::Running(running) if running.session.id() == id => Some(&running.session),
            _ => None,
        }
    }
}

/// Holds the one shell session allowed on a connection.
pub struct SessionRegistry {
    spec: ShellSpec,
    recording: Option<RecordingSink>,
    slot: Mutex<Slot>,
}

impl SessionRegistry {
    /// Create an empty registry. Sessions are recorded when `recording` is set.
    pub fn new(spec: ShellSpec, recording: Option<RecordingSink>) -> Self {
        Self {
            spec,
            recording,
            slot: Mutex::new(Slot::Absent),
        }
    }

    pub async fn state(&self) -> SlotState {
        self.slot.lock().await.state()
    }

    /// Id of the running session, if any.
    pub async fn active_session_id(&self) -> Option<SessionId> {
        match self.state().await {
            SlotState::Running(id) => Some(id),
            _ => None,
        }
    }

    /// Start a shell, optionally overriding the terminal size.
    ///
    /// Fails with [`SessionError::AlreadyRunning`] while another session is
    /// starting or running; that session is left untouched.
    pub async fn spawn(&self, size: Option<(u16, u16)>) -> Result<SpawnedSession, SessionError> {
        let previous = {
            let mut slot = self.slot.lock().await;
            if matches!(*slot, Slot::Starting | Slot::Running(_)) {
                return Err(SessionError::AlreadyRunning);
            }
            std::mem::replace(&mut *slot, Slot::Starting)
        };

        let mut spec = self.spec.clone();
        if let Some((cols, rows)) = size {
            spec.cols = cols;
            spec.rows = rows;
        }

        let spawned = tokio::task::spawn_blocking(move || PtySession::spawn(&spec))
            .await
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))
            .and_then(|result| result);

        let mut slot = self.slot.lock().await;
        let session = match spawned {
            Ok(session) => Arc::new(session),
            Err(e) => {
                *slot = previous;
                tracing::warn!(error = %e, "Failed to start shell");
                return Err(e);
            }
        };
        let id = session.id().clone();

        // subscribe before reading starts so nobody misses the first prompt
        let recorder = self.recording.as_ref().map(|sink| {
            let (_, rx) = session.output().subscribe_lossless();
            SessionRecorder::spawn(id.clone(), rx, Arc::clone(&sink.store), sink.settings.clone())
        });
        let (_, output) = session.output().subscribe_bounded(DEFAULT_LIVE_CAPACITY);
        session.start_read_loop();

        *slot = Slot::Running(RunningSession { session, recorder });
        tracing::info!(session_id = %id, recording = self.recording.is_some(), "Shell session started");

        Ok(SpawnedSession { id, output })
    }

    /// Write input to the running session.
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<(), SessionError> {
        let session = self.lookup(id).await?;
        session.write(data).await
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        let session = self.lookup(id).await?;
        session.resize(cols, rows)
    }

    /// Stop the running session. Returns once the shell is reaped and the
    /// recording sealed.
    pub async fn stop(&self, id: &str) -> Result<SessionStatus, SessionError> {
        let running = {
            let mut slot = self.slot.lock().await;
            if slot.running(id).is_none() {
                return Err(SessionError::NotFound(id.to_string()));
            }
            match std::mem::replace(&mut *slot, Slot::Stopped { id: id.to_string() }) {
                Slot::Running(running) => running,
                _ => return Err(SessionError::NotFound(id.to_string())),
            }
        };

        tracing::info!(session_id = %id, "Stopping shell session");
        running.finish().await
    }

    /// Retire a session whose shell exited on its own.
    ///
    /// Returns true if this call moved the slot to stopped, false if the
    /// session was already stopped or replaced.
    pub async fn reap(&self, id: &str) -> bool {
        let running = {
            let mut slot = self.slot.lock().await;
            match slot.running(id) {
                Some(session) if !session.is_running() => {}
                _ => return false,
            }
            match std::mem::replace(&mut *slot, Slot::Stopped { id: id.to_string() }) {
                Slot::Running(running) => running,
                _ => return false,
            }
        };

        match running.finish().await {
            Ok(status) => {
                tracing::info!(session_id = %id, status = ?status, "Shell exited");
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Failed to reap exited shell");
            }
        }
        true
    }

    /// Stop whatever is running. Used when the connection goes away.
    pub async fn shutdown(&self) {
        let running = {
            let mut slot = self.slot.lock().await;
            let id = match &*slot {
                Slot::Running(running) => running.session.id().clone(),
                _ => return,
            };
            match std::mem::replace(&mut *slot, Slot::Stopped { id }) {
                Slot::Running(running) => running,
                _ => return,
            }
        };

        let id = running.session.id().clone();
        if let Err(e) = running.finish().await {
            tracing::warn!(session_id = %id, error = %e, "Failed to stop shell on shutdown");
        } else {
            tracing::info!(session_id = %id, "Shell session stopped on shutdown");
        }
    }

    async fn lookup(&self, id: &str) -> Result<Arc<PtySession>, SessionError> {
        let slot = self.slot.lock().await;
        slot.running(id)
            .filter(|session| session.is_running())
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{
        decode_log, MemoryRecordingStore, RecorderSettings, RecordingStore,
    };
    use protocol::FrameCodec;
    use std::time::Duration;
    use tokio::time::timeout;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(ShellSpec::default(), None)
    }

    async fn wait_for(rx: &mut mpsc::Receiver<OutputChunk>, needle: &str) -> bool {
        let mut text = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(chunk)) => {
                    text.push_str(&String::from_utf8_lossy(&chunk.data));
                    if text.contains(needle) {
                        return true;
                    }
                }
                Ok(None) => return false,
                Err(_) => {}
            }
        }
        false
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let registry = registry();
        assert_eq!(registry.state().await, SlotState::Absent);

        let spawned = registry.spawn(None).await.unwrap();
        assert_eq!(registry.state().await, SlotState::Running(spawned.id.clone()));
        assert_eq!(registry.active_session_id().await, Some(spawned.id.clone()));

        registry.stop(&spawned.id).await.unwrap();
        assert_eq!(registry.state().await, SlotState::Stopped(spawned.id.clone()));
        assert_eq!(registry.active_session_id().await, None);
    }

    #[tokio::test]
    async fn test_second_spawn_rejected_and_first_untouched() {
        let registry = registry();
        let mut first = registry.spawn(None).await.unwrap();

        let err = registry.spawn(None).await.err().unwrap();
        assert!(matches!(err, SessionError::AlreadyRunning));

        registry.write(&first.id, b"echo still_alive\n").await.unwrap();
        assert!(wait_for(&mut first.output, "still_alive").await);

        registry.stop(&first.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_on_unknown_or_stopped_session() {
        let registry = registry();
        assert!(matches!(
            registry.stop("missing").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.write("missing", b"x").await,
            Err(SessionError::NotFound(_))
        ));

        let spawned = registry.spawn(None).await.unwrap();
        assert!(matches!(
            registry.write("other-id", b"x").await,
            Err(SessionError::NotFound(_))
        ));

        registry.stop(&spawned.id).await.unwrap();
        assert!(matches!(
            registry.stop(&spawned.id).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.write(&spawned.id, b"ls\n").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.resize(&spawned.id, 100, 30).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_gets_fresh_id() {
        let registry = registry();
        let first = registry.spawn(None).await.unwrap();
        registry.stop(&first.id).await.unwrap();

        let mut second = registry.spawn(Some((120, 40))).await.unwrap();
        assert_ne!(first.id, second.id);

        registry.write(&second.id, b"stty size\n").await.unwrap();
        assert!(wait_for(&mut second.output, "40 120").await);
        registry.stop(&second.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_spawn_restores_slot() {
        let registry = SessionRegistry::new(
            ShellSpec {
                command: "/nonexistent/shell".to_string(),
                ..ShellSpec::default()
            },
            None,
        );
        assert!(matches!(
            registry.spawn(None).await,
            Err(SessionError::SpawnFailed(_))
        ));
        assert_eq!(registry.state().await, SlotState::Absent);
    }

    #[tokio::test]
    async fn test_reap_after_shell_exit() {
        let registry = registry();
        let mut spawned = registry.spawn(None).await.unwrap();

        // still running, nothing to reap
        assert!(!registry.reap(&spawned.id).await);

        registry.write(&spawned.id, b"exit\n").await.unwrap();
        let drained = timeout(Duration::from_secs(5), async {
            while spawned.output.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());

        assert!(registry.reap(&spawned.id).await);
        assert!(!registry.reap(&spawned.id).await);
        assert_eq!(registry.state().await, SlotState::Stopped(spawned.id));
    }

    #[tokio::test]
    async fn test_stop_seals_recording() {
        let store = Arc::new(MemoryRecordingStore::new());
        let sink = RecordingSink::new(store.clone(), RecorderSettings::default());
        let registry = SessionRegistry::new(ShellSpec::default(), Some(sink));

        let mut spawned = registry.spawn(None).await.unwrap();
        registry.write(&spawned.id, b"echo recorded_marker\n").await.unwrap();
        assert!(wait_for(&mut spawned.output, "recorded_marker").await);

        registry.stop(&spawned.id).await.unwrap();
        assert!(store.is_sealed(&spawned.id));

        let chunks = decode_log(&FrameCodec::new(), &spawned.id, &store.read(&spawned.id).unwrap())
            .unwrap();
        let text: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
        assert!(String::from_utf8_lossy(&text).contains("recorded_marker"));
    }

    #[tokio::test]
    async fn test_slow_live_consumer_sees_every_recorded_byte() {
        let store = Arc::new(MemoryRecordingStore::new());
        let sink = RecordingSink::new(store.clone(), RecorderSettings::default());
        let registry = SessionRegistry::new(ShellSpec::default(), Some(sink));

        let mut spawned = registry.spawn(None).await.unwrap();
        registry
            .write(&spawned.id, b"seq 1 100000; printf 'SEQ%s\\n' _DONE\n")
            .await
            .unwrap();

        let mut live = Vec::new();
        let finished = timeout(Duration::from_secs(60), async {
            let mut received = 0u64;
            while let Some(chunk) = spawned.output.recv().await {
                live.extend_from_slice(&chunk.data);
                received += 1;
                if received % 8 == 0 {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                if String::from_utf8_lossy(&live).contains("SEQ_DONE") {
                    break;
                }
            }
        })
        .await;
        assert!(finished.is_ok());

        registry.stop(&spawned.id).await.unwrap();
        while let Some(chunk) = spawned.output.recv().await {
            live.extend_from_slice(&chunk.data);
        }

        let expected: String = (1..=100000).map(|i| format!("{i}\r\n")).collect();
        assert!(String::from_utf8_lossy(&live).contains(&expected));

        let recorded: Vec<u8> =
            decode_log(&FrameCodec::new(), &spawned.id, &store.read(&spawned.id).unwrap())
                .unwrap()
                .into_iter()
                .flat_map(|c| c.data)
                .collect();
        assert_eq!(live.len(), recorded.len());
        assert!(live == recorded);
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_session() {
        let registry = registry();
        let spawned = registry.spawn(None).await.unwrap();
        registry.shutdown().await;
        assert_eq!(registry.state().await, SlotState::Stopped(spawned.id));

        // idempotent
        registry.shutdown().await;
    }
}
