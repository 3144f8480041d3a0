//! Configuration management for the termhub daemon.
//!
//! TOML configuration for the termhub daemon: sessions, server, history.
//! The default configuration path is `~/.config/termhub/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::multiplexer::DEFAULT_CLIENT_QUEUE;
use crate::session::{detect_shell, DEFAULT_BUFFER_CAPACITY};

/// Reasons a configuration is rejected by [`Config::validate`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("buffer_capacity must be between 1 byte and 16 MiB, got {0}")]
    InvalidBufferCapacity(usize),

    #[error("listen_addr must be a socket address like 127.0.0.1:3456, got {0}")]
    InvalidListenAddr(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("client_queue must be at least 1, got {0}")]
    InvalidClientQueue(usize),

    #[error("cols and rows must be non-zero, got {0}x{1}")]
    InvalidTerminalSize(u16, u16),
}

/// Levels accepted by `daemon.log_level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for a session's replay buffer.
const MAX_BUFFER_CAPACITY: usize = 16 * 1024 * 1024;

/// Main configuration structure for the termhub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP and WebSocket listener.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Session history persistence.
    pub history: HistoryConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (history, etc.).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket server binds to.
    pub listen_addr: String,

    /// Events an observer may have queued before it is disconnected.
    pub client_queue: usize,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Default shell to use for new sessions.
    pub default_shell: String,

    /// Command typed into every new session, followed by a carriage return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_command: Option<String>,

    /// Replay buffer size per session in bytes.
    pub buffer_capacity: usize,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,
}

/// History persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    /// File name of the history store, relative to `daemon.data_dir`.
    pub file_name: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3456".to_string(),
            client_queue: DEFAULT_CLIENT_QUEUE,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: detect_shell(None),
            startup_command: None,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_sessions: 32,
            cols: 120,
            rows: 30,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            file_name: "history.json".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("config.toml")
}

/// `~/.local/share/termhub` or the platform equivalent.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
}

impl Config {
    /// Overlay `TERMHUB_*` environment variables onto the loaded values.
    ///
    /// Set variables win over the file; empty ones are ignored.
    /// Supported variables:
    /// - TERMHUB_LISTEN_ADDR: Override the listen address
    /// - TERMHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMHUB_SHELL: Override the session shell
    pub fn apply_env_overrides(&mut self) {
        if let Some(addr) = non_empty_env("TERMHUB_LISTEN_ADDR") {
            tracing::info!(listen_addr = %addr, "Overriding listen_addr from environment");
            self.server.listen_addr = addr;
        }

        if let Some(level) = non_empty_env("TERMHUB_LOG_LEVEL") {
            tracing::info!(log_level = %level, "Overriding log_level from environment");
            self.daemon.log_level = level;
        }

        if let Some(shell) = non_empty_env("TERMHUB_SHELL") {
            tracing::info!(shell = %shell, "Overriding default_shell from environment");
            self.session.default_shell = shell;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Session limit
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.buffer_capacity == 0 || self.session.buffer_capacity > MAX_BUFFER_CAPACITY {
            return Err(ConfigError::InvalidBufferCapacity(self.session.buffer_capacity));
        }

        if self.server.client_queue == 0 {
            return Err(ConfigError::InvalidClientQueue(self.server.client_queue));
        }

        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize(
                self.session.cols,
                self.session.rows,
            ));
        }

        if self.listen_addr().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }

        // Shell must resolve, either as a path or on PATH
        let shell_path = Path::new(&self.session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        // Log level
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(
                self.daemon.log_level.clone(),
            ));
        }

        Ok(())
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.server.listen_addr.parse()
    }

    /// Full path of the history file.
    pub fn history_path(&self) -> PathBuf {
        self.daemon.data_dir.join(&self.history.file_name)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Loads `~/.config/termhub/config.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
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

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Renders the configuration as pretty TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Renders a TOML error with its byte span, when known.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
