//! # termhub Daemon Library
//!
//! This crate runs several interactive terminal sessions in parallel, each
//! bound to a working directory, and lets remote observers watch and drive
//! them over a WebSocket.
//!
//! ## Overview
//!
//! - **Sessions**: one PTY process per session, a bounded replay buffer and a
//!   `running → waiting → completed` status machine
//! - **Multiplexer**: routes observer commands to sessions and session output
//!   to the observers subscribed to it
//! - **Notifications**: external hooks report status by working directory
//! - **History**: a JSON log of every session that outlives the daemon
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────┐   ┌───────────────────────────┐  │
//! │  │  HTTP API  /  WS /ws   │──▶│        Multiplexer        │  │
//! │  └────────────────────────┘   │  ┌─────────────────────┐  │  │
//! │                               │  │   SessionRegistry   │  │  │
//! │  ┌────────────────────────┐   │  └─────────────────────┘  │  │
//! │  │   PTY event pump       │──▶│   clients, subscribers    │  │
//! │  └────────────────────────┘   └─────────────┬─────────────┘  │
//! │                                             ▼                │
//! │                               ┌───────────────────────────┐  │
//! │                               │       HistoryStore        │  │
//! │                               └───────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use termhub::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serve until told to stop...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY adapter, replay buffer, status machine and registry
//! - [`multiplexer`]: Connections, subscriptions and notification intake
//! - [`history`]: Persistent session history
//! - [`server`]: HTTP and WebSocket routes
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod history;
pub mod multiplexer;
pub mod orchestrator;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use termhub_protocol as protocol;

pub use config::{Config, ConfigError};
pub use history::{HistoryError, HistoryStore};
pub use multiplexer::{ClientId, Multiplexer, NotifyOutcome};
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use session::{SessionError, SessionId, SessionRegistry};
