//! Connection supervisor.
//!
//! A single background task keeps the agent connected: it waits for the
//! local dependency, connects, serves the connection until it drops, then
//! backs off and tries again. Each connection gets a fresh
//! [`SessionRegistry`]; losing the connection stops its session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Channel, Connector, DependencyProbe};
use crate::config::ReconnectConfig;
use crate::recording::RecordingSink;
use crate::router::MessageRouter;
use crate::session::{SessionRegistry, ShellSpec};

/// Default reconnection settings.
const INITIAL_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 5_000;
const BACKOFF_MULTIPLIER: f64 = 2.0;
const BACKOFF_JITTER: f64 = 0.1;

/// Errors from the supervisor itself. Transport errors never surface here;
/// they are retried.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `start` was called more than once.
    #[error("supervisor already started")]
    AlreadyRunning,

    /// The configured attempt limit was reached without a connection.
    #[error("gave up after {0} failed connection attempts")]
    AttemptsExhausted(u32),

    /// The background task panicked or was aborted.
    #[error("supervisor task failed: {0}")]
    TaskFailed(String),
}

/// Connection state for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; waiting for the dependency or backing off.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and serving messages.
    Connected,
    /// Attempts exhausted. Terminal.
    Failed,
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Relative jitter applied to every delay, e.g. `0.1` for ±10 %.
    pub jitter: f64,
    /// Consecutive failures allowed before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(INITIAL_BACKOFF_MS),
            max: Duration::from_millis(MAX_BACKOFF_MS),
            multiplier: BACKOFF_MULTIPLIER,
            jitter: BACKOFF_JITTER,
            max_attempts: None,
        }
    }
}

impl From<&ReconnectConfig> for BackoffPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            jitter: BACKOFF_JITTER,
            max_attempts: config.max_attempts,
        }
    }
}

/// Backoff state: yields successive delays until reset.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.initial,
            policy,
            attempts: 0,
        }
    }

    /// Failures recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure and return how long to wait before the next try,
    /// or `None` once the attempt limit is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self
            .policy
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
        {
            return None;
        }

        let base = self.current.min(self.policy.max);
        // an overflowing or non-finite product just means "at the cap"
        self.current = Duration::try_from_secs_f64(base.as_secs_f64() * self.policy.multiplier)
            .unwrap_or(self.policy.max)
            .min(self.policy.max);

        let jitter = self.policy.jitter.abs();
        let delay = if jitter > 0.0 && jitter.is_finite() {
            let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
            Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
        } else {
            base
        };
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial;
        self.attempts = 0;
    }
}

/// What the supervisor runs on each connection.
#[derive(Clone)]
pub struct SupervisorSettings {
    pub backoff: BackoffPolicy,
    /// Longest wait between dependency checks.
    pub dependency_poll: Duration,
    pub shell: ShellSpec,
    pub recording: Option<RecordingSink>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            dependency_poll: Duration::from_millis(500),
            shell: ShellSpec::default(),
            recording: None,
        }
    }
}

/// Keeps one connection to the backend alive.
pub struct ConnectionSupervisor<C, P> {
    connector: Arc<C>,
    probe: Arc<P>,
    settings: SupervisorSettings,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<Result<(), SupervisorError>>>>,
}

impl<C: Connector, P: DependencyProbe> ConnectionSupervisor<C, P> {
    pub fn new(connector: C, probe: P, settings: SupervisorSettings) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector: Arc::new(connector),
            probe: Arc::new(probe),
            settings,
            state_tx: Arc::new(state_tx),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Spawn the supervision loop. May be called once.
    pub fn start(&self) -> Result<(), SupervisorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyRunning);
        }

        let worker = Worker {
            connector: Arc::clone(&self.connector),
            probe: Arc::clone(&self.probe),
            settings: self.settings.clone(),
            state_tx: Arc::clone(&self.state_tx),
            cancel: self.cancel.clone(),
        };
        let handle = tokio::spawn(worker.run());
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the loop and wait for it to exit. Any live session is stopped
    /// and its recording sealed before this returns.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.cancel.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| SupervisorError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        }
    }
}

impl<C, P> Drop for ConnectionSupervisor<C, P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker<C, P> {
    connector: Arc<C>,
    probe: Arc<P>,
    settings: SupervisorSettings,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
}

impl<C: Connector, P: DependencyProbe> Worker<C, P> {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?state, "Connection state changed");
            *current = state;
            true
        });
    }

    async fn run(self) -> Result<(), SupervisorError> {
        let mut backoff = Backoff::new(self.settings.backoff.clone());

        loop {
            if !self.wait_for_dependency().await {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(channel) => {
                    backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    tracing::info!("Connected to server");

                    self.serve(channel).await;
                    self.set_state(ConnectionState::Disconnected);
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    tracing::warn!("Connection to server lost");
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    tracing::warn!(error = %e, attempt = backoff.attempts() + 1, "Connection attempt failed");
                }
            }

            let Some(delay) = backoff.next_delay() else {
                self.set_state(ConnectionState::Failed);
                tracing::error!(attempts = backoff.attempts(), "Giving up on connecting");
                return Err(SupervisorError::AttemptsExhausted(backoff.attempts()));
            };
            tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Connection supervisor stopped");
        Ok(())
    }

    /// Returns false if cancelled while waiting.
    async fn wait_for_dependency(&self) -> bool {
        let policy = BackoffPolicy {
            initial: self.settings.backoff.initial.min(self.settings.dependency_poll),
            max: self.settings.dependency_poll,
            max_attempts: None,
            ..self.settings.backoff.clone()
        };
        let mut backoff = Backoff::new(policy);

        loop {
            let checked = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                checked = self.probe.check() => checked,
            };
            match checked {
                Ok(()) => {
                    if backoff.attempts() > 0 {
                        tracing::info!(waited_checks = backoff.attempts(), "Local dependency is available");
                    }
                    return true;
                }
                Err(e) => {
                    if backoff.attempts() == 0 {
                        tracing::info!(error = %e, "Waiting for local dependency");
                    } else {
                        tracing::debug!(error = %e, "Local dependency still unavailable");
                    }
                }
            }

            let delay = backoff.next_delay().unwrap_or(self.settings.dependency_poll);
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Route messages until the connection drops or the supervisor stops.
    async fn serve(&self, channel: Channel) {
        let Channel {
            outbound,
            mut inbound,
        } = channel;
        let registry = Arc::new(SessionRegistry::new(
            self.settings.shell.clone(),
            self.settings.recording.clone(),
        ));
        let router = MessageRouter::new(registry, outbound);

        loop {
            let bytes = tokio::select! {
                _ = self.cancel.cancelled() => break,
                bytes = inbound.recv() => bytes,
            };
            let Some(bytes) = bytes else { break };
            if let Err(e) = router.handle(&bytes).await {
                tracing::warn!(error = %e, "Dropping connection");
                break;
            }
        }

        router.shutdown().await;
    }
}
