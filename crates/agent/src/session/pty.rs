//! PTY-backed shell process.
//!
//! A [`PtySession`] owns one pseudo-terminal and the shell running on it.
//! Output is read on a blocking thread and published to an [`OutputFanout`],
//! each chunk tagged with the terminal's echo flag as observed right after
//! the read.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::LocalFlags;
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::watch;
use uuid::Uuid;

use super::{EchoMode, OutputChunk, OutputFanout, SessionError, SessionId};

/// Buffer size for reading from the pty.
const READ_BUFFER_SIZE: usize = 4096;

/// How long `terminate` waits for the reader to drain after the shell dies,
/// and again after killing the shell's process group.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Final status of a shell process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Exited(u32),
}

/// What to spawn and how big the terminal is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSpec {
    pub command: String,
    pub cols: u16,
    pub rows: u16,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
}

impl Default for ShellSpec {
    fn default() -> Self {
        Self {
            command: "/bin/sh".to_string(),
            cols: 80,
            rows: 24,
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

impl From<&crate::config::ShellConfig> for ShellSpec {
    fn from(config: &crate::config::ShellConfig) -> Self {
        Self {
            command: config.command.clone(),
            cols: config.cols,
            rows: config.rows,
            env: config.env.clone(),
            cwd: None,
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A shell process attached to a pseudo-terminal.
pub struct PtySession {
    id: SessionId,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    fanout: Arc<OutputFanout>,
    running: Arc<AtomicBool>,
    reader_started: AtomicBool,
    reader_done: watch::Receiver<bool>,
    reader_done_tx: Arc<watch::Sender<bool>>,
    size: Mutex<(u16, u16)>,
    pid: Option<u32>,
}

impl PtySession {
    /// Allocate a pty and spawn the shell on it.
    ///
    /// Output is not read until [`start_read_loop`](Self::start_read_loop) is
    /// called, so subscribers attached before that see everything.
    pub fn spawn(spec: &ShellSpec) -> Result<Self, SessionError> {
        let id = Uuid::new_v4().to_string();

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        if let Some(dir) = &spec.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // only the child keeps the slave side open, so reads hit EOF once it exits
        drop(pair.slave);

        let pid = child.process_id();
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (reader_done_tx, reader_done) = watch::channel(false);

        tracing::info!(session_id = %id, pid = ?pid, shell = %spec.command, "Spawned shell");

        Ok(Self {
            id,
            master: Arc::new(Mutex::new(pair.master)),
            writer: Arc::new(Mutex::new(writer)),
            child: Arc::new(Mutex::new(child)),
            fanout: Arc::new(OutputFanout::new()),
            running: Arc::new(AtomicBool::new(true)),
            reader_started: AtomicBool::new(false),
            reader_done,
            reader_done_tx: Arc::new(reader_done_tx),
            size: Mutex::new((spec.cols, spec.rows)),
            pid,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The fan-out carrying this session's output.
    pub fn output(&self) -> &Arc<OutputFanout> {
        &self.fanout
    }

    /// Write input to the shell.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotFound(self.id.clone()));
        }

        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut writer = lock(&writer);
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(|e| SessionError::WriteFailed(e.to_string()))?
        .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    /// Start the blocking read loop. Has no effect after the first call.
    ///
    /// When the shell closes the terminal the fan-out is closed, which ends
    /// every subscriber's stream.
    pub fn start_read_loop(&self) {
        if self.reader_started.swap(true, Ordering::SeqCst) {
            tracing::warn!(session_id = %self.id, "Read loop already running");
            return;
        }

        let master = Arc::clone(&self.master);
        let fanout = Arc::clone(&self.fanout);
        let running = Arc::clone(&self.running);
        let done = Arc::clone(&self.reader_done_tx);
        let session_id = self.id.clone();

        let reader = lock(&master).try_clone_reader();
        let mut reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to get PTY reader");
                running.store(false, Ordering::SeqCst);
                fanout.close();
                done.send_replace(true);
                return;
            }
        };

        tokio::task::spawn_blocking(move || {
            let mut echo = EchoMode::Enabled;
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];

            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::info!(session_id = %session_id, "PTY EOF, shell exited");
                        break;
                    }
                    Ok(n) => {
                        if let Some(observed) = read_echo_mode(&master) {
                            if observed != echo {
                                tracing::debug!(session_id = %session_id, echo = ?observed, "Terminal echo changed");
                                echo = observed;
                            }
                        }
                        fanout.publish(OutputChunk::new(buffer[..n].to_vec(), echo));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how Linux reports a hung-up pty
                        if running.load(Ordering::SeqCst) {
                            tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                        }
                        break;
                    }
                }
            }

            running.store(false, Ordering::SeqCst);
            fanout.close();
            done.send_replace(true);
        });
    }

    /// Resize the terminal.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotFound(self.id.clone()));
        }

        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        *lock(&self.size) = (cols, rows);

        tracing::debug!(session_id = %self.id, cols, rows, "Resized PTY");
        Ok(())
    }

    /// Kill and reap the shell, then wait briefly for buffered output to
    /// drain before detaching all subscribers.
    pub async fn terminate(&self) -> Result<SessionStatus, SessionError> {
        self.running.store(false, Ordering::SeqCst);

        let child = Arc::clone(&self.child);
        let status = tokio::task::spawn_blocking(move || {
            let mut child = lock(&child);
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            child.kill()?;
            child.wait()
        })
        .await
        .map_err(|e| SessionError::KillFailed(e.to_string()))?
        .map_err(|e| SessionError::KillFailed(e.to_string()))?;

        if self.reader_started.load(Ordering::SeqCst)
            && !self.wait_reader(READER_DRAIN_TIMEOUT).await
        {
            // a leftover background job still holds the terminal open
            tracing::warn!(
                session_id = %self.id,
                pid = ?self.pid,
                "PTY reader blocked after kill, killing process group"
            );
            self.kill_process_group();
            if !self.wait_reader(READER_DRAIN_TIMEOUT).await {
                tracing::warn!(session_id = %self.id, "PTY reader still blocked, detaching subscribers");
            }
        }
        self.fanout.close();

        let status = SessionStatus::Exited(status.exit_code());
        tracing::info!(session_id = %self.id, status = ?status, "Shell terminated");
        Ok(status)
    }

    async fn wait_reader(&self, limit: Duration) -> bool {
        let mut done = self.reader_done.clone();
        let finished = tokio::time::timeout(limit, done.wait_for(|d| *d))
            .await
            .is_ok();
        finished
    }

    /// SIGKILL everything left in the shell's process group and, on Linux,
    /// in its session. The shell is started as a session leader, so its pid
    /// is both the group and the session id.
    fn kill_process_group(&self) {
        let Some(pgid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            tracing::debug!(session_id = %self.id, pgid, error = %e, "killpg failed");
        }

        // background jobs of an interactive shell get their own groups
        #[cfg(target_os = "linux")]
        for pid in session_members(pgid) {
            if let Err(e) = nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
                tracing::debug!(session_id = %self.id, pid, error = %e, "kill failed");
            }
        }
    }

    /// Check whether the shell has exited without waiting.
    pub fn try_wait(&self) -> Result<Option<SessionStatus>, SessionError> {
        Ok(lock(&self.child)
            .try_wait()?
            .map(|status| SessionStatus::Exited(status.exit_code())))
    }

    /// Resolves once the read loop has finished.
    pub async fn reader_finished(&self) {
        let mut done = self.reader_done.clone();
        let _ = done.wait_for(|d| *d).await;
    }
}

/// Pids whose session id is `sid`, read from `/proc/{pid}/stat`.
#[cfg(target_os = "linux")]
fn session_members(sid: i32) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| {
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|stat| parse_session_id(&stat))
                == Some(sid)
        })
        .collect()
}

/// Session id from a `/proc/{pid}/stat` line. The command name may contain
/// spaces and parentheses, so fields are counted from the last `)`.
#[cfg(target_os = "linux")]
fn parse_session_id(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // state ppid pgrp session
    rest.split_whitespace().nth(3)?.parse().ok()
}

/// Read the terminal's echo flag through the master side.
fn read_echo_mode(master: &Mutex<Box<dyn MasterPty + Send>>) -> Option<EchoMode> {
    let termios = lock(master).get_termios()?;
    // portable-pty hands back its own nix version's termios, so compare raw bits
    Some(if termios.local_flags.bits() & LocalFlags::ECHO.bits() != 0 {
        EchoMode::Enabled
    } else {
        EchoMode::Disabled
    })
}
