//! Protocol message definitions for termhub.
//!
//! Everything on the wire is JSON. Observer connections exchange
//! [`ClientMessage`] and [`ServerEvent`] values tagged by a `kind` field; the
//! notification intake accepts a [`NotificationRequest`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque session identifier.
pub type SessionId = String;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// The process is working.
    Running,
    /// The process is idle, waiting for operator input.
    Waiting,
    /// The session has ended. Terminal.
    Completed,
}

impl SessionStatus {
    /// Returns true for the terminal `completed` state.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed)
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of status notification reported by an external hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyType {
    Waiting,
    Running,
    Completed,
}

impl NotifyType {
    /// The status this notification asks for.
    pub fn target_status(self) -> SessionStatus {
        match self {
            NotifyType::Waiting => SessionStatus::Waiting,
            NotifyType::Running => SessionStatus::Running,
            NotifyType::Completed => SessionStatus::Completed,
        }
    }
}

/// Body of a notification posted by the external hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    /// What happened inside the session.
    #[serde(rename = "type")]
    pub notify_type: NotifyType,
    /// Directory the reporting process runs in.
    pub working_directory: String,
}

/// Session record exposed to observers and the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub working_directory: String,
    pub status: SessionStatus,
    /// Creation time in Unix epoch milliseconds.
    pub created_at: u64,
}

/// Durable copy of a session's metadata.
///
/// History records outlive the in-memory session and are only removed by an
/// explicit bulk clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: SessionId,
    pub working_directory: String,
    pub status: SessionStatus,
    /// Creation time in Unix epoch milliseconds.
    pub created_at: u64,
    /// End time in Unix epoch milliseconds, set once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    /// Size in bytes of the session's replay buffer at the last update.
    #[serde(default)]
    pub output_size: usize,
}

impl HistoryRecord {
    /// Creates a fresh record for a newly created session.
    pub fn from_session(session: &SessionInfo) -> Self {
        Self {
            id: session.id.clone(),
            working_directory: session.working_directory.clone(),
            status: session.status,
            created_at: session.created_at,
            ended_at: None,
            output_size: 0,
        }
    }
}

/// Messages sent by an observer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Start receiving a session's output; triggers a one-off replay.
    Subscribe { session_id: SessionId },
    /// Stop receiving a session's output.
    Unsubscribe { session_id: SessionId },
    /// Keystrokes for the session's process.
    Input { session_id: SessionId, data: String },
    /// New terminal dimensions.
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
}

impl ClientMessage {
    /// The session this message targets.
    pub fn session_id(&self) -> &SessionId {
        match self {
            ClientMessage::Subscribe { session_id }
            | ClientMessage::Unsubscribe { session_id }
            | ClientMessage::Input { session_id, .. }
            | ClientMessage::Resize { session_id, .. } => session_id,
        }
    }
}

/// Events pushed to observer connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// A session was created. Sent to every connection.
    #[serde(rename = "session:created")]
    SessionCreated { session: SessionInfo },

    /// A session was deleted. Sent to every connection.
    #[serde(rename = "session:deleted")]
    SessionDeleted { session_id: SessionId },

    /// Process output. Sent to the session's subscribers only.
    #[serde(rename = "session:data")]
    SessionData { session_id: SessionId, data: String },

    /// The process exited on its own. Sent to every connection.
    #[serde(rename = "session:exit")]
    SessionExit { session_id: SessionId, exit_code: i32 },

    /// A hook notification changed a session's status. Sent to every connection.
    #[serde(rename = "notification")]
    Notification {
        session_id: SessionId,
        notify_type: NotifyType,
        status: SessionStatus,
    },

    /// A command from this connection failed.
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
}

impl ServerEvent {
    /// Builds an error scoped to one session.
    pub fn session_error(session_id: &SessionId, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
            session_id: Some(session_id.clone()),
        }
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::SessionCreated { .. } => "session:created",
            ServerEvent::SessionDeleted { .. } => "session:deleted",
            ServerEvent::SessionData { .. } => "session:data",
            ServerEvent::SessionExit { .. } => "session:exit",
            ServerEvent::Notification { .. } => "notification",
            ServerEvent::Error { .. } => "error",
        }
    }
}
