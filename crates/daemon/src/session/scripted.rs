//! In-memory PTY backend driven by hand.
//!
//! Nothing is spawned: every "process" records the input and resizes it
//! receives, and output or exit is injected with [`ScriptedBackend::emit`] and
//! [`ScriptedBackend::exit`]. The multiplexer and server test suites run on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::pty::{
    PtyBackend, PtyEvent, PtyEventSender, PtyProcess, SessionError, SessionId, SpawnRequest,
};

/// Exit code reported when a scripted process is killed.
pub const KILLED_EXIT_CODE: i32 = 137;

#[derive(Debug)]
struct ProcessRecord {
    cwd: String,
    cols: u16,
    rows: u16,
    input: Vec<u8>,
    alive: bool,
    kills: usize,
    events: PtyEventSender,
}

#[derive(Debug, Default)]
struct ScriptedState {
    processes: HashMap<SessionId, ProcessRecord>,
    spawn_order: Vec<SessionId>,
    fail_spawns: bool,
}

/// Backend whose processes are driven by the caller.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every following spawn fail (or succeed again).
    pub fn fail_spawns(&self, fail: bool) {
        self.lock().fail_spawns = fail;
    }

    /// Session ids in spawn order.
    pub fn spawned(&self) -> Vec<SessionId> {
        self.lock().spawn_order.clone()
    }

    /// Working directory a process was spawned in.
    pub fn cwd(&self, session_id: &str) -> Option<String> {
        self.lock().processes.get(session_id).map(|p| p.cwd.clone())
    }

    /// Everything written to a process, lossily decoded.
    pub fn input_text(&self, session_id: &str) -> String {
        self.lock()
            .processes
            .get(session_id)
            .map(|p| String::from_utf8_lossy(&p.input).into_owned())
            .unwrap_or_default()
    }

    /// Current terminal size of a process.
    pub fn size(&self, session_id: &str) -> Option<(u16, u16)> {
        self.lock()
            .processes
            .get(session_id)
            .map(|p| (p.cols, p.rows))
    }

    /// How many times a process was actually killed.
    pub fn kill_count(&self, session_id: &str) -> usize {
        self.lock()
            .processes
            .get(session_id)
            .map(|p| p.kills)
            .unwrap_or(0)
    }

    /// Returns whether a process is still alive.
    pub fn is_alive(&self, session_id: &str) -> bool {
        self.lock()
            .processes
            .get(session_id)
            .map(|p| p.alive)
            .unwrap_or(false)
    }

    /// Emits output from a live process. Returns false if it is gone.
    pub fn emit(&self, session_id: &str, data: &str) -> bool {
        let state = self.lock();
        match state.processes.get(session_id) {
            Some(p) if p.alive => p
                .events
                .send(PtyEvent::Output {
                    session_id: session_id.to_string(),
                    data: data.to_string(),
                })
                .is_ok(),
            _ => false,
        }
    }

    /// Makes a live process exit on its own with `exit_code`.
    pub fn exit(&self, session_id: &str, exit_code: i32) -> bool {
        let mut state = self.lock();
        match state.processes.get_mut(session_id) {
            Some(p) if p.alive => {
                p.alive = false;
                p.events
                    .send(PtyEvent::Exit {
                        session_id: session_id.to_string(),
                        exit_code,
                    })
                    .is_ok()
            }
            _ => false,
        }
    }
}

impl PtyBackend for ScriptedBackend {
    fn spawn(
        &self,
        request: SpawnRequest,
        events: PtyEventSender,
    ) -> Result<Box<dyn PtyProcess>, SessionError> {
        let mut state = self.lock();
        if state.fail_spawns {
            return Err(SessionError::SpawnFailed(format!(
                "scripted spawn failure in {}",
                request.cwd
            )));
        }

        state.spawn_order.push(request.session_id.clone());
        state.processes.insert(
            request.session_id.clone(),
            ProcessRecord {
                cwd: request.cwd,
                cols: request.cols,
                rows: request.rows,
                input: Vec::new(),
                alive: true,
                kills: 0,
                events,
            },
        );

        Ok(Box::new(ScriptedProcess {
            session_id: request.session_id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Handle returned by [`ScriptedBackend`].
#[derive(Debug)]
pub struct ScriptedProcess {
    session_id: SessionId,
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedProcess {
    fn with_record<T>(&self, f: impl FnOnce(&mut ProcessRecord) -> T) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.processes.get_mut(&self.session_id).map(f)
    }
}

impl PtyProcess for ScriptedProcess {
    fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let session_id = self.session_id.clone();
        self.with_record(|p| {
            if !p.alive {
                return Err(SessionError::AlreadyTerminated(session_id.clone()));
            }
            p.input.extend_from_slice(data);
            Ok(())
        })
        .unwrap_or_else(|| Err(SessionError::NotFound(session_id)))
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let session_id = self.session_id.clone();
        self.with_record(|p| {
            if !p.alive {
                return Err(SessionError::AlreadyTerminated(session_id.clone()));
            }
            p.cols = cols;
            p.rows = rows;
            Ok(())
        })
        .unwrap_or_else(|| Err(SessionError::NotFound(session_id)))
    }

    fn kill(&mut self) -> Result<(), SessionError> {
        let session_id = self.session_id.clone();
        self.with_record(|p| {
            if p.alive {
                p.alive = false;
                p.kills += 1;
                let _ = p.events.send(PtyEvent::Exit {
                    session_id,
                    exit_code: KILLED_EXIT_CODE,
                });
            }
        });
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.with_record(|p| p.alive).unwrap_or(false)
    }
}
