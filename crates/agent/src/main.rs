//! DevTerm agent
//!
//! Device-resident service that exposes a remote shell to a backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent::config::Config;
use agent::network::ConnectionState;
use agent::orchestrator::{AgentOrchestrator, OrchestratorEvent};
use agent::playback::PlaybackService;
use agent::recording::FileRecordingStore;
use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// DevTerm agent - remote shell access for this device.
#[derive(Parser, Debug)]
#[command(name = "devterm-agent")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the agent.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Connect to the backend and serve shell sessions until interrupted
    Run,

    /// Write a recorded session's output to stdout
    Playback {
        /// Session ID of the recording
        session_id: String,

        /// Delay between chunks in milliseconds
        #[arg(long, default_value = "0")]
        sleep_ms: u64,
    },

    /// List sealed recordings
    Recordings {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Print the built-in defaults instead
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = init_logging(&config, cli.verbose)?;
    if let Some(path) = &cli.config {
        tracing::debug!(path = %path.display(), "Using config file");
    }

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Playback {
            session_id,
            sleep_ms,
        } => playback(&config, &session_id, Duration::from_millis(sleep_ms)).await,
        Commands::Recordings { json } => list_recordings(&config, json).await,
        Commands::Config { default } => {
            let shown = if default { Config::default() } else { config };
            print!("{}", shown.to_toml()?);
            Ok(())
        }
    }
}

/// Console logging, plus a daily log file when `agent.log_dir` is set.
///
/// `RUST_LOG` wins over `--verbose`, which wins over the configured level.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.agent.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &config.agent.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "devterm-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "DevTerm agent starting...");

    let mut orchestrator = AgentOrchestrator::new(config)?;
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!(?state, "Orchestrator state");
                }
                OrchestratorEvent::ConnectionStateChanged(state) => {
                    tracing::info!(?state, "Connection state");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!(%message, "Orchestrator error");
                }
            }
        }
    });

    let mut connection = orchestrator.connection_state();
    let gave_up = tokio::select! {
        signal = wait_for_shutdown_signal() => {
            signal?;
            false
        }
        _ = connection.wait_for(|state| *state == ConnectionState::Failed) => true,
    };

    orchestrator.stop().await?;

    if gave_up {
        anyhow::bail!("Giving up: could not reach the server");
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

fn open_playback(config: &Config) -> anyhow::Result<PlaybackService> {
    let dir = config.recordings_dir();
    let store = FileRecordingStore::open(&dir)
        .with_context(|| format!("Failed to open recording store: {}", dir.display()))?;
    Ok(PlaybackService::new(Arc::new(store)))
}

async fn playback(config: &Config, session_id: &str, pacing: Duration) -> anyhow::Result<()> {
    let service = open_playback(config)?;
    let mut stream = service.open(session_id, pacing).await?;

    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = stream.next().await {
        stdout.write_all(&chunk.data).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn list_recordings(config: &Config, json: bool) -> anyhow::Result<()> {
    let recordings = open_playback(config)?.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&recordings)?);
        return Ok(());
    }

    if recordings.is_empty() {
        println!("No recordings.");
        return Ok(());
    }
    println!("{:<38} {:>10} {:>8}", "SESSION", "BYTES", "CHUNKS");
    for rec in &recordings {
        println!("{:<38} {:>10} {:>8}", rec.session_id, rec.size_bytes, rec.chunks);
    }
    Ok(())
}
