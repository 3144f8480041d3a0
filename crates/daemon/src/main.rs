//! termhub daemon
//!
//! Runs parallel PTY sessions and multiplexes them to remote observers.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use termhub::config::{default_config_path, Config};
use termhub::history::HistoryStore;
use termhub::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use termhub::protocol::HistoryRecord;
use tracing_subscriber::EnvFilter;

/// termhub - parallel terminal sessions with a realtime multiplexer.
#[derive(Parser, Debug)]
#[command(name = "termhub")]
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

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon and serve until SIGINT/SIGTERM
    Start,

    /// Show or clear the session history
    History {
        /// Print the records as JSON
        #[arg(long)]
        json: bool,

        /// Remove every record
        #[arg(long)]
        clear: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!(path = %config_path.display(), "Configuration loaded");

    // Handle commands
    match cli.command {
        Commands::Start => {
            config.validate()?;
            tracing::info!("termhub daemon starting...");

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::History { json, clear } => {
            let store = HistoryStore::open(config.history_path())
                .with_context(|| format!("Failed to read {}", config.history_path().display()))?;

            if clear {
                let removed = store.clear_history().await?;
                println!("Removed {} history record(s)", removed);
            } else if json {
                let records = store.get_history();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&records).context("Failed to encode history")?
                );
            } else {
                print_history_table(&store.get_history());
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Run the daemon until a shutdown signal arrives.
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    // Subscribe before starting so no event is missed
    let mut events = orchestrator.subscribe();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Listening { addr } => {
                    tracing::info!(%addr, "Accepting connections");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    orchestrator.start().await?;

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}

/// Print history records in a formatted ASCII table.
fn print_history_table(records: &[HistoryRecord]) {
    if records.is_empty() {
        println!("No session history.");
        return;
    }

    let dir_width = records
        .iter()
        .map(|r| r.working_directory.len())
        .max()
        .unwrap_or(9)
        .clamp(9, 48);

    println!(
        "{:<36}  {:<dir_width$}  {:<9}  {:>10}  {:>8}",
        "ID",
        "DIRECTORY",
        "STATUS",
        "CREATED",
        "OUTPUT",
        dir_width = dir_width
    );
    println!("{}", "-".repeat(36 + dir_width + 37));

    for record in records {
        println!(
            "{:<36}  {:<dir_width$}  {:<9}  {:>10}  {:>8}",
            record.id,
            truncate_str(&record.working_directory, dir_width),
            record.status.as_str(),
            format_relative_time(record.created_at),
            format_size(record.output_size),
            dir_width = dir_width
        );
    }

    println!();
    println!("Total: {} session(s)", records.len());
}

/// Format a Unix timestamp in milliseconds as relative time (e.g., "5m ago").
fn format_relative_time(timestamp_ms: u64) -> String {
    let elapsed = termhub::session::now_millis().saturating_sub(timestamp_ms) / 1000;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Format a byte count with a binary unit.
fn format_size(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else {
        format!("{:.1}KiB", bytes as f64 / 1024.0)
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let keep: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", keep)
    }
}
