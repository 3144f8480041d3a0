//! Pseudo-terminal process adapter.
//!
//! A [`PtyBackend`] spawns one process per session attached to a
//! pseudo-terminal rooted at the session's working directory. The returned
//! [`PtyProcess`] handle accepts input, resizes and kills. Output and exit are
//! not delivered through callbacks: the adapter pushes typed [`PtyEvent`]s onto
//! a channel that a single consumer drains, which keeps each session's output
//! in emission order.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use termhub_protocol::SessionId;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's process has already exited or been killed.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the session.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// The configured session limit has been reached.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Events emitted by PTY processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// A chunk of output, decoded as UTF-8 without splitting characters.
    Output { session_id: SessionId, data: String },
    /// The process exited on its own (or after a kill).
    Exit { session_id: SessionId, exit_code: i32 },
}

impl PtyEvent {
    /// The session the event belongs to.
    pub fn session_id(&self) -> &SessionId {
        match self {
            PtyEvent::Output { session_id, .. } | PtyEvent::Exit { session_id, .. } => session_id,
        }
    }
}

/// Sending half of the shared PTY event channel.
pub type PtyEventSender = mpsc::UnboundedSender<PtyEvent>;

/// Receiving half of the shared PTY event channel.
pub type PtyEventReceiver = mpsc::UnboundedReceiver<PtyEvent>;

/// Parameters for spawning a session process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub session_id: SessionId,
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
}

/// Spawns processes attached to pseudo-terminals.
pub trait PtyBackend: Send + Sync {
    /// Starts a process. Output and exit events are pushed onto `events`.
    fn spawn(
        &self,
        request: SpawnRequest,
        events: PtyEventSender,
    ) -> Result<Box<dyn PtyProcess>, SessionError>;
}

/// Handle to a live PTY process, exclusively owned by one session.
pub trait PtyProcess: Send {
    /// Writes input to the process.
    fn write(&mut self, data: &[u8]) -> Result<(), SessionError>;

    /// Resizes the terminal.
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Kills the process. Calling it again, or after the process exited, is a no-op.
    fn kill(&mut self) -> Result<(), SessionError>;

    /// Returns whether the process is still running.
    fn is_alive(&self) -> bool;

    /// OS process id, when known.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Backend using the platform's native PTY implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBackend;

impl PtyBackend for NativePtyBackend {
    fn spawn(
        &self,
        request: SpawnRequest,
        events: PtyEventSender,
    ) -> Result<Box<dyn PtyProcess>, SessionError> {
        let SpawnRequest {
            session_id,
            shell,
            cwd,
            cols,
            rows,
        } = request;

        if !Path::new(&cwd).is_dir() {
            return Err(SessionError::SpawnFailed(format!(
                "working directory does not exist: {cwd}"
            )));
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell);
        cmd.cwd(&cwd);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // The slave end must be closed here or the reader never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let alive = Arc::new(AtomicBool::new(true));

        {
            let session_id = session_id.clone();
            let alive = Arc::clone(&alive);
            tokio::task::spawn_blocking(move || read_loop(session_id, reader, child, alive, events));
        }

        tracing::debug!(session_id = %session_id, pid = ?pid, cwd = %cwd, "Spawned PTY process");

        Ok(Box::new(NativePtyProcess {
            session_id,
            master: pair.master,
            writer,
            killer,
            alive,
            pid,
        }))
    }
}

/// A process running under a native PTY.
pub struct NativePtyProcess {
    session_id: SessionId,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    alive: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl PtyProcess for NativePtyProcess {
    fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::AlreadyTerminated(self.session_id.clone()));
        }
        self.writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::AlreadyTerminated(self.session_id.clone()));
        }
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    fn kill(&mut self) -> Result<(), SessionError> {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.killer
            .kill()
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;
        tracing::info!(session_id = %self.session_id, pid = ?self.pid, "Killed PTY process");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for NativePtyProcess {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            tracing::debug!(session_id = %self.session_id, error = %e, "Kill on drop failed");
        }
    }
}

/// Blocking read loop: forwards output, then reaps the child and reports its exit.
fn read_loop(
    session_id: SessionId,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    alive: Arc<AtomicBool>,
    events: PtyEventSender,
) {
    let mut decoder = Utf8Decoder::default();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(session_id = %session_id, "PTY EOF");
                break;
            }
            Ok(n) => {
                let data = decoder.decode(&buffer[..n]);
                if data.is_empty() {
                    continue;
                }
                let event = PtyEvent::Output {
                    session_id: session_id.clone(),
                    data,
                };
                if events.send(event).is_err() {
                    tracing::debug!(session_id = %session_id, "Event channel closed, stopping reader");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the child side is gone.
                tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                break;
            }
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = events.send(PtyEvent::Output {
            session_id: session_id.clone(),
            data: tail,
        });
    }

    alive.store(false, Ordering::SeqCst);

    let exit_code = match child.wait() {
        Ok(status) => status.exit_code() as i32,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to reap PTY child");
            -1
        }
    };

    tracing::info!(session_id = %session_id, exit_code, "PTY process exited");
    let _ = events.send(PtyEvent::Exit {
        session_id,
        exit_code,
    });
}

/// Incremental UTF-8 decoder that never splits a character across chunks.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decodes as much of `chunk` as possible, holding back an incomplete
    /// trailing sequence for the next call. Invalid bytes become U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }

        out
    }

    /// Flushes whatever is still pending.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Detects the shell to use.
///
/// Returns the provided shell if any, then `$SHELL`, then `/bin/sh`
/// (`powershell.exe` on Windows).
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell {
        return s;
    }

    if cfg!(windows) {
        return "powershell.exe".to_string();
    }

    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
