//! Agent orchestrator for wiring together all components.
//!
//! The `AgentOrchestrator` builds the recording store, the connection
//! supervisor and the playback server from the configuration, and starts and
//! stops them together.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::network::{
    BackoffPolicy, ConnectionState, ConnectionSupervisor, SupervisorError, SupervisorSettings,
    UnixSocketProbe, WebSocketConfig, WebSocketConnector,
};
use crate::playback::{PlaybackServer, PlaybackService};
use crate::recording::{
    DirLock, FileRecordingStore, RecorderSettings, RecordingSink, RecordingStore,
};
use crate::session::ShellSpec;

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and maintaining the connection.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    StateChanged(OrchestratorState),
    ConnectionStateChanged(ConnectionState),
    Error { message: String },
}

/// Owns every long-running part of the agent.
pub struct AgentOrchestrator {
    config: Config,
    store: Arc<FileRecordingStore>,
    /// Ownership of the recordings directory, released on drop.
    _recordings_lock: DirLock,
    playback: Arc<PlaybackService>,
    supervisor: ConnectionSupervisor<WebSocketConnector, UnixSocketProbe>,
    state: Arc<RwLock<OrchestratorState>>,
    playback_addr: Option<SocketAddr>,
    shutdown_token: CancellationToken,
    tasks: TaskTracker,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl AgentOrchestrator {
    /// Build the agent from configuration. Nothing runs until [`start`](Self::start).
    ///
    /// Takes ownership of the recordings directory, failing if another agent
    /// holds it, and seals recordings a previous run left open.
    pub fn new(config: Config) -> Result<Self> {
        let recordings_dir = config.recordings_dir();
        let store = Arc::new(FileRecordingStore::open(&recordings_dir).with_context(|| {
            format!("Failed to open recording store: {}", recordings_dir.display())
        })?);
        let recordings_lock = DirLock::acquire(&recordings_dir)
            .context("Another agent is using this data directory")?;
        let recovered = store
            .recover_leftovers(&recordings_lock)
            .context("Failed to recover unsealed recordings")?;
        if recovered > 0 {
            warn!(recovered, "Sealed recordings left open by a previous run");
        }
        let dyn_store: Arc<dyn RecordingStore> = store.clone();

        let recording = config.recording.enabled.then(|| {
            RecordingSink::new(
                Arc::clone(&dyn_store),
                RecorderSettings::from(&config.recording),
            )
        });

        let settings = SupervisorSettings {
            backoff: BackoffPolicy::from(&config.reconnect),
            dependency_poll: config.dependency.poll_interval(),
            shell: ShellSpec::from(&config.shell),
            recording,
        };
        let supervisor = ConnectionSupervisor::new(
            WebSocketConnector::new(WebSocketConfig::from(&config.server)),
            UnixSocketProbe::new(config.dependency.socket_path.clone()),
            settings,
        );

        let (event_tx, _) = broadcast::channel(64);

        info!(
            server = %config.server.url,
            recordings = %recordings_dir.display(),
            recording_enabled = config.recording.enabled,
            "Agent configured"
        );

        Ok(Self {
            playback: Arc::new(PlaybackService::new(dyn_store)),
            config,
            store,
            _recordings_lock: recordings_lock,
            supervisor,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            playback_addr: None,
            shutdown_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
            event_tx,
        })
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Watch the backend connection state.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.subscribe()
    }

    pub fn playback(&self) -> &Arc<PlaybackService> {
        &self.playback
    }

    pub fn store(&self) -> &Arc<FileRecordingStore> {
        &self.store
    }

    /// Address the playback server listens on, once started.
    pub fn playback_addr(&self) -> Option<SocketAddr> {
        self.playback_addr
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the connection supervisor and, if enabled, the playback server.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));
        info!("Starting agent...");

        if self.config.playback.enabled {
            let server = PlaybackServer::bind(
                &self.config.playback.listen_addr,
                Arc::clone(&self.playback),
                self.config.playback.linger(),
            )
            .await
            .context("Failed to start playback server")?;
            self.playback_addr = Some(server.local_addr()?);
            self.tasks.spawn(server.run(self.shutdown_token.child_token()));
        }

        self.supervisor
            .start()
            .context("Failed to start connection supervisor")?;
        self.tasks.spawn(forward_connection_state(
            self.supervisor.subscribe(),
            self.event_tx.clone(),
            self.shutdown_token.clone(),
        ));

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));
        info!(playback = ?self.playback_addr, "Agent started");
        Ok(())
    }

    /// Stop everything. Live sessions are stopped and their recordings sealed
    /// before this returns.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                OrchestratorState::Stopped => return Ok(()),
                OrchestratorState::ShuttingDown => {
                    anyhow::bail!("Orchestrator is already shutting down")
                }
                _ => *state = OrchestratorState::ShuttingDown,
            }
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::ShuttingDown));
        info!("Stopping agent...");

        match self.supervisor.shutdown().await {
            Ok(()) => debug!("Connection supervisor stopped"),
            Err(e @ SupervisorError::AttemptsExhausted(_)) => {
                warn!(error = %e, "Connection supervisor had given up");
            }
            Err(e) => {
                warn!(error = %e, "Connection supervisor failed");
                self.emit_event(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
            }
        }

        self.shutdown_token.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
        info!("Agent stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

async fn forward_connection_state(
    mut state: watch::Receiver<ConnectionState>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                let _ = event_tx.send(OrchestratorEvent::ConnectionStateChanged(current));
            }
        }
    }
}
