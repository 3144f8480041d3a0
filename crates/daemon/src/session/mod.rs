//! Session management module.
//!
//! This module provides PTY spawning, the per-session replay buffer and status
//! machine, and the registry that ties them together.

pub mod buffer;
pub mod pty;
pub mod registry;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;
pub mod status;

use std::time::{SystemTime, UNIX_EPOCH};

pub use buffer::{OutputBuffer, DEFAULT_BUFFER_CAPACITY};
pub use pty::{
    detect_shell, NativePtyBackend, PtyBackend, PtyEvent, PtyEventReceiver, PtyEventSender,
    PtyProcess, SessionError, SessionId, SpawnRequest,
};
pub use registry::{normalize_directory, PostCreateHook, RegistryConfig, SessionRegistry};
#[cfg(any(test, feature = "test-util"))]
pub use scripted::ScriptedBackend;
pub use status::Transition;

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
