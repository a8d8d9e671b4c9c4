//! Per-session recorder task.
//!
//! The recorder consumes a lossless subscription to the session's output,
//! tracks the terminal echo mode, and persists every chunk in order. Writes
//! are batched and run on the blocking pool so storage latency never reaches
//! the pty reader.
//!
//! A batch the store rejects stays buffered and is retried on the next flush.
//! A recording whose final flush still fails is left unsealed, so it is never
//! offered for playback as if it were complete.

use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::FrameCodec;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{encode_chunk, RecordedChunk, RecordingStore, StoreError};

/// Flush attempts made for the last batch before giving up on sealing.
const FINAL_FLUSH_ATTEMPTS: u32 = 3;
use crate::session::{EchoMode, OutputChunk, SessionId};

/// Batching parameters for recording writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderSettings {
    pub flush_interval: Duration,
    pub flush_threshold_bytes: usize,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(250),
            flush_threshold_bytes: 32 * 1024,
        }
    }
}

impl From<&crate::config::RecordingConfig> for RecorderSettings {
    fn from(config: &crate::config::RecordingConfig) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            flush_threshold_bytes: config.flush_threshold_bytes,
        }
    }
}

/// What a recorder did over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub chunks: u64,
    pub bytes: u64,
    pub echo_transitions: u64,
    pub write_errors: u64,
    /// Encoded bytes still unwritten when the recorder gave up.
    pub unpersisted_bytes: u64,
    pub sealed: bool,
}

/// Handle to a running recorder.
pub struct RecorderHandle {
    session_id: SessionId,
    task: JoinHandle<RecorderStats>,
}

impl RecorderHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Wait until the recording is flushed and sealed.
    ///
    /// The recorder finishes once the session's output stream ends.
    pub async fn finish(self) -> RecorderStats {
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "Recorder task failed");
                RecorderStats::default()
            }
        }
    }
}

/// Records one session.
pub struct SessionRecorder {
    session_id: SessionId,
    store: Arc<dyn RecordingStore>,
    settings: RecorderSettings,
    codec: FrameCodec,
    echo: EchoMode,
    seq: u64,
    started: Instant,
    pending: Vec<u8>,
    /// The last flush failed.
    failing: bool,
    stats: RecorderStats,
}

impl SessionRecorder {
    /// Create the recording and start consuming `output` on a new task.
    pub fn spawn(
        session_id: SessionId,
        output: mpsc::UnboundedReceiver<OutputChunk>,
        store: Arc<dyn RecordingStore>,
        settings: RecorderSettings,
    ) -> RecorderHandle {
        let recorder = Self {
            session_id: session_id.clone(),
            store,
            settings,
            codec: FrameCodec::new(),
            echo: EchoMode::Enabled,
            seq: 0,
            started: Instant::now(),
            pending: Vec::new(),
            failing: false,
            stats: RecorderStats::default(),
        };
        RecorderHandle {
            session_id,
            task: tokio::spawn(recorder.run(output)),
        }
    }

    async fn run(mut self, mut output: mpsc::UnboundedReceiver<OutputChunk>) -> RecorderStats {
        let created = self
            .blocking({
                let id = self.session_id.clone();
                move |store| store.create(&id)
            })
            .await;
        if let Err(e) = created {
            // keep draining so the fan-out never backs up, but persist nothing
            tracing::error!(session_id = %self.session_id, error = %e, "Failed to create recording");
            while output.recv().await.is_some() {}
            return self.stats;
        }
        tracing::debug!(session_id = %self.session_id, "Recording started");

        let mut ticker = tokio::time::interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Some(chunk) => {
                        self.record(chunk);
                        // while failing, retries wait for the ticker
                        if !self.failing && self.pending.len() >= self.settings.flush_threshold_bytes {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }

        if !self.final_flush().await {
            self.stats.unpersisted_bytes = self.pending.len() as u64;
            tracing::error!(
                session_id = %self.session_id,
                unpersisted_bytes = self.stats.unpersisted_bytes,
                write_errors = self.stats.write_errors,
                "Recording incomplete, leaving it unsealed"
            );
            return self.stats;
        }

        let sealed = self
            .blocking({
                let id = self.session_id.clone();
                move |store| store.seal(&id)
            })
            .await;
        match sealed {
            Ok(()) => {
                self.stats.sealed = true;
                tracing::info!(
                    session_id = %self.session_id,
                    chunks = self.stats.chunks,
                    bytes = self.stats.bytes,
                    echo_transitions = self.stats.echo_transitions,
                    "Recording sealed"
                );
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "Failed to seal recording");
            }
        }
        self.stats
    }

    /// Current echo mode.
    pub fn echo(&self) -> EchoMode {
        self.echo
    }

    fn set_echo(&mut self, mode: EchoMode) {
        if mode == self.echo {
            return;
        }
        tracing::info!(
            session_id = %self.session_id,
            from = ?self.echo,
            to = ?mode,
            seq = self.seq,
            "Terminal echo mode changed"
        );
        self.echo = mode;
        self.stats.echo_transitions += 1;
    }

    fn record(&mut self, chunk: OutputChunk) {
        self.set_echo(chunk.echo);

        let recorded = RecordedChunk {
            seq: self.seq,
            at_ms: self.started.elapsed().as_millis() as u64,
            echo: self.echo,
            data: chunk.data.to_vec(),
        };
        match encode_chunk(&self.codec, &recorded) {
            Ok(frame) => {
                self.pending.extend_from_slice(&frame);
                self.seq += 1;
                self.stats.chunks += 1;
                self.stats.bytes += chunk.data.len() as u64;
            }
            Err(e) => {
                self.stats.write_errors += 1;
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to encode recorded chunk");
            }
        }
    }

    /// Persist everything pending. On failure the batch stays pending, ahead
    /// of anything recorded since, and is retried by the next flush.
    async fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        let batch = Arc::new(std::mem::take(&mut self.pending));
        let id = self.session_id.clone();
        let written = Arc::clone(&batch);
        match self.blocking(move |store| store.append(&id, &written)).await {
            Ok(()) => {
                if self.failing {
                    tracing::info!(session_id = %self.session_id, "Recording writes recovered");
                }
                self.failing = false;
                true
            }
            Err(e) => {
                self.stats.write_errors += 1;
                if !self.failing {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "Failed to persist recording batch, will retry"
                    );
                }
                self.failing = true;
                let mut batch = Arc::try_unwrap(batch).unwrap_or_else(|shared| (*shared).clone());
                batch.append(&mut self.pending);
                self.pending = batch;
                false
            }
        }
    }

    async fn final_flush(&mut self) -> bool {
        for attempt in 1..=FINAL_FLUSH_ATTEMPTS {
            if self.flush().await {
                return true;
            }
            if attempt < FINAL_FLUSH_ATTEMPTS {
                tokio::time::sleep(self.settings.flush_interval).await;
            }
        }
        false
    }

    async fn blocking<F>(&self, op: F) -> Result<(), StoreError>
    where
        F: FnOnce(&dyn RecordingStore) -> Result<(), StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| StoreError::Io {
                path: Default::default(),
                source: std::io::Error::other(e.to_string()),
            })?
    }
}
