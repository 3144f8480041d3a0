//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that owns the session store
//! for the lifetime of the daemon: it loads history, builds the registry and
//! multiplexer, runs the PTY event pump and the HTTP/WebSocket server, and on
//! shutdown stops the server and kills every session.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::history::HistoryStore;
use crate::multiplexer::Multiplexer;
use crate::server::{self, AppState};
use crate::session::{
    NativePtyBackend, PtyBackend, PtyEventReceiver, RegistryConfig, SessionRegistry,
};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The server is bound and accepting connections.
    Listening { addr: SocketAddr },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Registry, subscriptions and history.
    mux: Arc<Multiplexer>,
    /// PTY events, handed to the pump on start.
    pty_events: Option<PtyEventReceiver>,
    /// Address the server actually bound to.
    local_addr: Option<SocketAddr>,
    /// Background tasks started by `start`.
    tasks: Vec<JoinHandle<()>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator that spawns real PTYs.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_backend(config, Arc::new(NativePtyBackend))
    }

    /// Creates a new daemon orchestrator on a specific PTY backend.
    pub fn with_backend(config: Config, backend: Arc<dyn PtyBackend>) -> Result<Self> {
        let history_path = config.history_path();
        let history = Arc::new(
            HistoryStore::open(&history_path)
                .with_context(|| format!("Failed to load history: {}", history_path.display()))?,
        );
        info!(
            path = %history_path.display(),
            records = history.len(),
            "History store ready"
        );

        let (pty_tx, pty_rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(backend, pty_tx, RegistryConfig::from(&config.session));
        let mux = Arc::new(
            Multiplexer::new(registry, history).with_client_queue(config.server.client_queue),
        );

        let (event_tx, _) = broadcast::channel(100);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            mux,
            pty_events: Some(pty_rx),
            local_addr: None,
            tasks: Vec::new(),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    pub async fn start(&mut self) -> Result<()> {
        // Check current state
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let Some(pty_events) = self.pty_events.take() else {
            self.set_state(OrchestratorState::Stopped).await;
            anyhow::bail!("Orchestrator cannot be restarted after stop");
        };

        let addr = match self.config.listen_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.set_state(OrchestratorState::Stopped).await;
                return Err(e).with_context(|| {
                    format!("Invalid listen address: {}", self.config.server.listen_addr)
                });
            }
        };
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.set_state(OrchestratorState::Stopped).await;
                self.emit_event(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
                return Err(e).with_context(|| format!("Failed to bind {addr}"));
            }
        };
        let local_addr = listener.local_addr().context("Failed to read bound address")?;
        self.local_addr = Some(local_addr);

        // Event pump
        let mux = Arc::clone(&self.mux);
        let shutdown_token = self.shutdown_token.clone();
        self.tasks.push(tokio::spawn(async move {
            mux.run_event_pump(pty_events, shutdown_token).await;
        }));
        debug!("Started PTY event pump");

        // HTTP/WebSocket server
        let app_state = AppState::new(Arc::clone(&self.mux), self.shutdown_token.clone());
        let event_tx = self.event_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(listener, app_state).await {
                error!(error = %e, "HTTP server failed");
                let _ = event_tx.send(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
            }
        }));

        self.set_state(OrchestratorState::Running).await;
        self.emit_event(OrchestratorEvent::Listening { addr: local_addr });

        info!(addr = %local_addr, "Daemon orchestrator started successfully");
        Ok(())
    }

    /// Stops the daemon orchestrator gracefully.
    pub async fn stop(&mut self) -> Result<()> {
        // Check current state
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        // Kill all sessions
        let killed = self.mux.teardown().await;
        debug!(killed, "Sessions torn down");

        self.history_flush().await;

        self.set_state(OrchestratorState::Stopped).await;
        info!("Daemon orchestrator stopped");
        Ok(())
    }

    async fn history_flush(&self) {
        if let Err(e) = self.mux.history().persist().await {
            warn!(error = %e, "Error saving history");
        }
    }

    async fn set_state(&self, next: OrchestratorState) {
        *self.state.write().await = next;
        self.emit_event(OrchestratorEvent::StateChanged(next));
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the multiplexer.
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    /// Returns the address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the configuration the daemon runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ScriptedBackend;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        config.session.default_shell = "sh".to_string();
        config
    }

    fn create_orchestrator(temp_dir: &TempDir) -> (DaemonOrchestrator, ScriptedBackend) {
        let backend = ScriptedBackend::new();
        let orchestrator =
            DaemonOrchestrator::with_backend(create_test_config(temp_dir), Arc::new(backend.clone()))
                .unwrap();
        (orchestrator, backend)
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir));
        assert!(orchestrator.is_ok());

        let orchestrator = orchestrator.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_creation_fails_on_corrupt_history() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("history.json"), "{").unwrap();

        let result = DaemonOrchestrator::new(create_test_config(&temp_dir));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let (mut orchestrator, backend) = create_orchestrator(&temp_dir);
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        let addr = orchestrator.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(orchestrator.start().await.is_err());

        let session = orchestrator
            .multiplexer()
            .create_session("/work")
            .await
            .unwrap();

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(!backend.is_alive(&session.id));
        assert_eq!(orchestrator.multiplexer().session_count().await, 0);

        // History survives the daemon.
        let history = HistoryStore::open(orchestrator.config().history_path()).unwrap();
        assert!(history.get(&session.id).unwrap().ended_at.is_some());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                seen.push(state);
            }
        }
        assert_eq!(
            seen,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let (mut orchestrator, _backend) = create_orchestrator(&temp_dir);
        assert!(orchestrator.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_restart_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let (mut orchestrator, _backend) = create_orchestrator(&temp_dir);

        orchestrator.start().await.unwrap();
        orchestrator.stop().await.unwrap();

        assert!(orchestrator.start().await.is_err());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }
}
