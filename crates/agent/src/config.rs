//! Configuration management for the DevTerm agent.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/devterm/agent.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("server url must be a ws:// or wss:// URL, got {0}")]
    InvalidServerUrl(String),

    #[error("shell command does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("initial_backoff_ms ({initial}) must be non-zero and not exceed max_backoff_ms ({max})")]
    InvalidBackoff { initial: u64, max: u64 },

    #[error("backoff multiplier must be between 1.0 and 10.0, got {0}")]
    InvalidBackoffMultiplier(f64),

    #[error("heartbeat_interval_secs ({interval}) and heartbeat_timeout_secs ({timeout}) must be greater than 0")]
    InvalidHeartbeat { interval: u64, timeout: u64 },

    #[error("dependency poll_interval_ms must be greater than 0")]
    InvalidPollInterval,

    #[error("flush_interval_ms must be greater than 0")]
    InvalidFlushInterval,

    #[error("playback listen_addr is not a socket address: {0}")]
    InvalidListenAddr(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest accepted reconnect backoff multiplier.
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

/// Main configuration structure for the DevTerm agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General agent configuration.
    pub agent: AgentConfig,

    /// Remote backend connection.
    pub server: ServerConfig,

    /// Shell spawned for each session.
    pub shell: ShellConfig,

    /// Session recording.
    pub recording: RecordingConfig,

    /// Recording playback server.
    pub playback: PlaybackConfig,

    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,

    /// Local IPC dependency that must be up before connecting.
    pub dependency: DependencyConfig,
}

/// General agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory for agent data (recordings).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// When set, logs are also written to daily-rotated files here.
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket URL of the backend.
    pub url: String,

    /// Bearer token sent on connect.
    pub token: Option<String>,

    pub heartbeat_interval_secs: u64,

    pub heartbeat_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell executable, absolute or looked up in `PATH`.
    pub command: String,

    pub cols: u16,

    pub rows: u16,

    /// Extra environment variables for the shell.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,

    /// Maximum time buffered output waits before being persisted.
    pub flush_interval_ms: u64,

    /// Buffered bytes that force an early flush.
    pub flush_threshold_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub enabled: bool,

    pub listen_addr: String,

    /// How long an idle playback socket is kept open after the last chunk.
    pub linger_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    pub multiplier: f64,

    /// Give up after this many consecutive failures. Unlimited when unset.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DependencyConfig {
    /// Unix socket of the local IPC dependency. No wait when unset.
    pub socket_path: Option<PathBuf>,

    pub poll_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/api/devices/v1/connect".to_string(),
            token: None,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: default_shell(),
            cols: 80,
            rows: 24,
            env: BTreeMap::new(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_ms: 250,
            flush_threshold_bytes: 32 * 1024,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:8181".to_string(),
            linger_secs: 5,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            poll_interval_ms: 500,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl RecordingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl PlaybackConfig {
    pub fn linger(&self) -> Duration {
        Duration::from_secs(self.linger_secs)
    }
}

impl DependencyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devterm")
        .join("agent.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devterm")
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    /// Directory holding session recordings.
    pub fn recordings_dir(&self) -> PathBuf {
        self.agent.data_dir.join("recordings")
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DEVTERM_SERVER_URL: Override the backend URL
    /// - DEVTERM_SERVER_TOKEN: Override the bearer token
    /// - DEVTERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - DEVTERM_DEPENDENCY_SOCKET: Override the local dependency socket path
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env("DEVTERM_SERVER_URL") {
            tracing::info!(url = %url, "Overriding server url from environment");
            self.server.url = url;
        }

        if let Some(token) = non_empty_env("DEVTERM_SERVER_TOKEN") {
            tracing::info!("Overriding server token from environment");
            self.server.token = Some(token);
        }

        if let Some(level) = non_empty_env("DEVTERM_LOG_LEVEL") {
            tracing::info!(level = %level, "Overriding log_level from environment");
            self.agent.log_level = level;
        }

        if let Some(socket) = non_empty_env("DEVTERM_DEPENDENCY_SOCKET") {
            tracing::info!(socket = %socket, "Overriding dependency socket from environment");
            self.dependency.socket_path = Some(PathBuf::from(socket));
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match url::Url::parse(&self.server.url) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
            _ => return Err(ConfigError::InvalidServerUrl(self.server.url.clone())),
        }

        let shell_path = Path::new(&self.shell.command);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.shell.command).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(self.shell.command.clone()));
        }

        if self.shell.cols == 0 || self.shell.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.shell.cols,
                rows: self.shell.rows,
            });
        }

        let level = self.agent.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.agent.log_level.clone()));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_backoff_ms == 0 || reconnect.initial_backoff_ms > reconnect.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff {
                initial: reconnect.initial_backoff_ms,
                max: reconnect.max_backoff_ms,
            });
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&reconnect.multiplier) {
            return Err(ConfigError::InvalidBackoffMultiplier(reconnect.multiplier));
        }

        // a zero interval makes tokio's interval panic; a zero timeout drops
        // every connection on the first heartbeat
        let server = &self.server;
        if server.heartbeat_interval_secs == 0 || server.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::InvalidHeartbeat {
                interval: server.heartbeat_interval_secs,
                timeout: server.heartbeat_timeout_secs,
            });
        }

        if self.dependency.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }

        if self.recording.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidFlushInterval);
        }

        if self.playback.enabled && self.playback.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(self.playback.listen_addr.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
