//! Persistent session history.
//!
//! Every session gets a [`HistoryRecord`] when it is created. The record is
//! updated on status changes and stamped with `endedAt` when the session ends,
//! and it outlives the in-memory session. The store persists to
//! `<data_dir>/history.json`.
//!
//! Memory is authoritative. Each mutation updates the in-memory records first
//! and then writes a full snapshot to disk; writes are serialized through a
//! single write gate so the file always holds a complete image. A failed
//! write is logged and the next mutation writes the full state again.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use termhub_protocol::{HistoryRecord, SessionInfo, SessionStatus};
use thiserror::Error;

use crate::session::now_millis;

/// Errors raised while reading or writing the history file.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// Reading, writing or renaming the file failed.
    #[error("history I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but does not contain a valid history image.
    #[error("invalid history file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The records could not be serialized.
    #[error("failed to serialize history: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// On-disk layout.
#[derive(Debug, Serialize, Deserialize)]
struct HistoryData {
    /// Version of the file format (for future migrations).
    version: u32,
    sessions: Vec<HistoryRecord>,
}

impl Default for HistoryData {
    fn default() -> Self {
        Self {
            version: 1,
            sessions: Vec::new(),
        }
    }
}

/// Durable log of session metadata.
pub struct HistoryStore {
    path: PathBuf,
    /// Records in creation order.
    records: Mutex<Vec<HistoryRecord>>,
    /// Held for the duration of every disk write.
    write_gate: tokio::sync::Mutex<()>,
}

impl HistoryStore {
    /// Creates an empty store that will persist to `path`.
    ///
    /// This does not read the file; call [`load`](Self::load) for that.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            records: Mutex::new(Vec::new()),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Creates a store and loads whatever is already on disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HistoryError> {
        let store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    /// Path of the history file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn records(&self) -> MutexGuard<'_, Vec<HistoryRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the in-memory records with the file's contents.
    ///
    /// A missing file leaves the store empty.
    pub fn load(&self) -> Result<(), HistoryError> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "History file not found, starting empty");
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path).map_err(|source| HistoryError::Io {
            path: self.path.clone(),
            source,
        })?;
        let data: HistoryData =
            serde_json::from_str(&contents).map_err(|source| HistoryError::Parse {
                path: self.path.clone(),
                source,
            })?;

        let mut records = self.records();
        *records = data.sessions;
        tracing::info!(
            count = records.len(),
            path = %self.path.display(),
            "Loaded session history"
        );
        Ok(())
    }

    /// Inserts or replaces the record for `session` in memory only.
    ///
    /// Used from the registry's post-create hook; the next persisting call
    /// writes it out.
    pub fn record_created(&self, session: &SessionInfo) {
        let record = HistoryRecord::from_session(session);
        let mut records = self.records();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    /// Upserts the record for `session` and persists.
    pub async fn save_session(&self, session: &SessionInfo) {
        self.record_created(session);
        self.flush().await;
    }

    /// Records a status change. Unknown ids are ignored.
    pub async fn update_status(&self, session_id: &str, status: SessionStatus, output_size: usize) {
        let found = {
            let mut records = self.records();
            match records.iter_mut().find(|r| r.id == session_id) {
                Some(record) => {
                    record.status = status;
                    record.output_size = output_size;
                    true
                }
                None => false,
            }
        };
        if found {
            self.flush().await;
        }
    }

    /// Stamps the end of a session. Only the first call sets `endedAt`.
    ///
    /// Returns true if this call ended the record.
    pub async fn end_session(&self, session_id: &str, output_size: usize) -> bool {
        let ended = {
            let mut records = self.records();
            match records.iter_mut().find(|r| r.id == session_id) {
                Some(record) if record.ended_at.is_none() => {
                    record.ended_at = Some(now_millis());
                    record.status = SessionStatus::Completed;
                    record.output_size = output_size;
                    true
                }
                _ => false,
            }
        };
        if ended {
            self.flush().await;
        }
        ended
    }

    /// All records, oldest first.
    pub fn get_history(&self) -> Vec<HistoryRecord> {
        self.records().clone()
    }

    /// Looks up one record.
    pub fn get(&self, session_id: &str) -> Option<HistoryRecord> {
        self.records().iter().find(|r| r.id == session_id).cloned()
    }

    /// Removes every record and persists the empty image.
    pub async fn clear_history(&self) -> Result<usize, HistoryError> {
        let removed = {
            let mut records = self.records();
            let removed = records.len();
            records.clear();
            removed
        };
        self.persist().await?;
        tracing::info!(removed, "History cleared");
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Persists the current records, logging instead of failing.
    pub async fn flush(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "Failed to persist history, keeping it in memory");
        }
    }

    /// Blocks every persist until the guard is dropped.
    #[cfg(test)]
    pub(crate) async fn hold_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_gate.lock().await
    }

    /// Writes the current records to disk.
    ///
    /// The snapshot is taken after the write gate is acquired, so a writer
    /// that waited always stores state at least as new as the one before it.
    pub async fn persist(&self) -> Result<(), HistoryError> {
        let _gate = self.write_gate.lock().await;

        let data = HistoryData {
            version: 1,
            sessions: self.get_history(),
        };
        let contents = serde_json::to_string_pretty(&data)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| HistoryError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, contents.as_bytes())
            .await
            .map_err(|source| HistoryError::Io {
                path: temp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|source| HistoryError::Io {
                path: self.path.clone(),
                source,
            })?;

        tracing::debug!(
            count = data.sessions.len(),
            path = %self.path.display(),
            "Saved session history"
        );
        Ok(())
    }
}
