//! Session registry.
//!
//! Owns every live session: its metadata, its PTY process handle and its
//! replay buffer. The registry itself does no locking and emits no events; the
//! multiplexer holds it behind one mutex together with the subscriber sets and
//! is responsible for telling observers what changed.

use std::collections::HashMap;
use std::sync::Arc;

use termhub_protocol::{SessionInfo, SessionStatus};
use uuid::Uuid;

use super::buffer::{OutputBuffer, DEFAULT_BUFFER_CAPACITY};
use super::pty::{PtyBackend, PtyEventSender, PtyProcess, SessionError, SessionId, SpawnRequest};
use super::status::Transition;
use super::now_millis;
use crate::config::SessionConfig;

/// Settings the registry applies to every session it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Shell spawned in each session.
    pub shell: String,
    /// Command typed into the shell right after spawn.
    pub startup_command: Option<String>,
    /// Replay buffer size in bytes.
    pub buffer_capacity: usize,
    /// Maximum number of sessions held at once.
    pub max_sessions: usize,
    /// Initial terminal size.
    pub cols: u16,
    pub rows: u16,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            shell: super::pty::detect_shell(None),
            startup_command: None,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_sessions: 32,
            cols: 120,
            rows: 30,
        }
    }
}

impl From<&SessionConfig> for RegistryConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            shell: config.default_shell.clone(),
            startup_command: config
                .startup_command
                .clone()
                .filter(|cmd| !cmd.trim().is_empty()),
            buffer_capacity: config.buffer_capacity,
            max_sessions: config.max_sessions,
            cols: config.cols,
            rows: config.rows,
        }
    }
}

/// Called synchronously by [`SessionRegistry::create`] once a session is registered.
pub trait PostCreateHook: Send + Sync {
    fn session_created(&self, session: &SessionInfo);
}

impl<F> PostCreateHook for F
where
    F: Fn(&SessionInfo) + Send + Sync,
{
    fn session_created(&self, session: &SessionInfo) {
        self(session)
    }
}

/// A registered session.
struct SessionEntry {
    info: SessionInfo,
    /// Normalized working directory used for notification matching.
    match_key: String,
    /// Creation order; the highest wins directory collisions.
    sequence: u64,
    /// `None` once the process has exited and been released.
    process: Option<Box<dyn PtyProcess>>,
    buffer: OutputBuffer,
}

impl SessionEntry {
    fn release_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.kill() {
                tracing::debug!(session_id = %self.info.id, error = %e, "Kill during release failed");
            }
        }
    }
}

/// Registry of live sessions.
pub struct SessionRegistry {
    sessions: HashMap<SessionId, SessionEntry>,
    next_sequence: u64,
    backend: Arc<dyn PtyBackend>,
    events: PtyEventSender,
    config: RegistryConfig,
    hooks: Vec<Box<dyn PostCreateHook>>,
}

impl SessionRegistry {
    /// Creates an empty registry. Processes it spawns report on `events`.
    pub fn new(backend: Arc<dyn PtyBackend>, events: PtyEventSender, config: RegistryConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            next_sequence: 0,
            backend,
            events,
            config,
            hooks: Vec::new(),
        }
    }

    /// Registers a hook run after every successful create.
    pub fn add_post_create_hook(&mut self, hook: impl PostCreateHook + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Returns the registry settings.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Spawns a process in `working_directory` and registers it as a new session.
    ///
    /// Nothing is registered if the spawn fails.
    pub fn create(&mut self, working_directory: &str) -> Result<SessionInfo, SessionError> {
        if self.sessions.len() >= self.config.max_sessions {
            return Err(SessionError::LimitReached(self.config.max_sessions));
        }

        let id = Uuid::new_v4().to_string();
        let mut process = self.backend.spawn(
            SpawnRequest {
                session_id: id.clone(),
                shell: self.config.shell.clone(),
                cwd: working_directory.to_string(),
                cols: self.config.cols,
                rows: self.config.rows,
            },
            self.events.clone(),
        )?;

        if let Some(command) = &self.config.startup_command {
            if let Err(e) = process.write(format!("{command}\r").as_bytes()) {
                tracing::warn!(session_id = %id, error = %e, "Failed to send startup command");
            }
        }

        let info = SessionInfo {
            id: id.clone(),
            working_directory: working_directory.to_string(),
            status: SessionStatus::Running,
            created_at: now_millis(),
        };

        self.next_sequence += 1;
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                info: info.clone(),
                match_key: normalize_directory(working_directory),
                sequence: self.next_sequence,
                process: Some(process),
                buffer: OutputBuffer::new(self.config.buffer_capacity),
            },
        );

        for hook in &self.hooks {
            hook.session_created(&info);
        }

        tracing::info!(
            session_id = %id,
            working_directory = %working_directory,
            "Created new session"
        );

        Ok(info)
    }

    /// Kills the session's process and forgets the session.
    ///
    /// Returns false for unknown ids.
    pub fn delete(&mut self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some(mut entry) => {
                entry.release_process();
                tracing::info!(session_id = %session_id, "Session deleted");
                true
            }
            None => false,
        }
    }

    /// Forwards input to the session's process.
    ///
    /// Returns false if the session is unknown or its process is gone.
    pub fn write(&mut self, session_id: &str, data: &[u8]) -> bool {
        let Some(process) = self.live_process(session_id) else {
            return false;
        };
        match process.write(data) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Write failed");
                false
            }
        }
    }

    /// Resizes the session's terminal. Same contract as [`write`](Self::write).
    pub fn resize(&mut self, session_id: &str, cols: u16, rows: u16) -> bool {
        let Some(process) = self.live_process(session_id) else {
            return false;
        };
        match process.resize(cols, rows) {
            Ok(()) => {
                tracing::debug!(session_id = %session_id, cols, rows, "Resized PTY");
                true
            }
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Resize failed");
                false
            }
        }
    }

    fn live_process(&mut self, session_id: &str) -> Option<&mut Box<dyn PtyProcess>> {
        self.sessions
            .get_mut(session_id)?
            .process
            .as_mut()
            .filter(|process| process.is_alive())
    }

    /// Finds the session running in `dir`, ignoring case and separator style.
    ///
    /// When several sessions match, the most recently created one wins.
    pub fn find_by_directory(&self, dir: &str) -> Option<SessionInfo> {
        let key = normalize_directory(dir);
        self.sessions
            .values()
            .filter(|entry| entry.match_key == key)
            .max_by_key(|entry| entry.sequence)
            .map(|entry| entry.info.clone())
    }

    /// Moves a session towards `status`, honouring terminality of `completed`.
    ///
    /// Returns `None` for unknown ids.
    pub fn transition(&mut self, session_id: &str, status: SessionStatus) -> Option<Transition> {
        let entry = self.sessions.get_mut(session_id)?;
        let transition = Transition::evaluate(entry.info.status, status);
        if let Some(next) = transition.target() {
            entry.info.status = next;
            if next.is_terminal() {
                entry.buffer.freeze();
            }
        }
        Some(transition)
    }

    /// Sets a session's status. Returns true if the request was applied.
    pub fn update_status(&mut self, session_id: &str, status: SessionStatus) -> bool {
        matches!(self.transition(session_id, status), Some(t) if t.is_applied())
    }

    /// Handles the process exiting on its own: releases the handle and completes the session.
    ///
    /// Returns `None` for unknown ids.
    pub fn mark_exited(&mut self, session_id: &str) -> Option<Transition> {
        let entry = self.sessions.get_mut(session_id)?;
        entry.release_process();
        self.transition(session_id, SessionStatus::Completed)
    }

    /// Records process output in the replay buffer.
    ///
    /// Returns false if the session is unknown, already completed or its
    /// process has been released.
    pub fn append_output(&mut self, session_id: &str, data: &[u8]) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(entry) if entry.process.is_some() => entry.buffer.append(data),
            _ => false,
        }
    }

    /// Snapshot of the raw replay buffer.
    pub fn output_buffer(&self, session_id: &str) -> Option<Vec<u8>> {
        self.sessions.get(session_id).map(|e| e.buffer.snapshot())
    }

    /// Replay buffer decoded for sending to observers.
    pub fn output_text(&self, session_id: &str) -> Option<String> {
        self.sessions.get(session_id).map(|e| e.buffer.snapshot_text())
    }

    /// Number of bytes in the replay buffer.
    pub fn output_size(&self, session_id: &str) -> Option<usize> {
        self.sessions.get(session_id).map(|e| e.buffer.len())
    }

    /// Gets a session record.
    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|e| e.info.clone())
    }

    /// Returns whether the session's process is still running.
    pub fn is_alive(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .and_then(|e| e.process.as_ref())
            .map(|p| p.is_alive())
            .unwrap_or(false)
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut entries: Vec<&SessionEntry> = self.sessions.values().collect();
        entries.sort_by_key(|e| e.sequence);
        entries.into_iter().map(|e| e.info.clone()).collect()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Kills every live process and empties the registry.
    ///
    /// Returns the ids that were removed.
    pub fn teardown(&mut self) -> Vec<SessionId> {
        let ids: Vec<SessionId> = self.list().into_iter().map(|s| s.id).collect();
        for (_, mut entry) in self.sessions.drain() {
            entry.release_process();
        }
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Registry torn down");
        }
        ids
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Normalizes a directory for matching: `\` becomes `/`, case is folded and
/// trailing separators are dropped.
pub fn normalize_directory(dir: &str) -> String {
    let unified = dir.trim().replace('\\', "/").to_lowercase();
    let trimmed = unified.trim_end_matches('/');
    if trimmed.is_empty() && !unified.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
