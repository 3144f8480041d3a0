//! Outbound side of one observer connection.

use termhub_protocol::ServerEvent;
use tokio::sync::mpsc;

/// Unique identifier for a connected observer.
pub type ClientId = String;

/// Default number of events a connection may have queued.
pub const DEFAULT_CLIENT_QUEUE: usize = 1024;

/// Statistics about a client's message handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Events queued for the connection.
    pub messages_sent: u64,
    /// Events that could not be queued because the queue was full.
    pub messages_dropped: u64,
    /// Events that could not be queued because the connection was gone.
    pub messages_failed: u64,
}

/// A handle representing a connected observer.
///
/// Each connection has a bounded queue drained by its socket task. A send
/// that finds the queue full fails, and the multiplexer then drops the whole
/// connection rather than a single event, so a live stream never has gaps.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<ServerEvent>,
    stats: ClientStats,
}

impl ClientHandle {
    /// Creates a new client handle and the receiver its connection drains.
    pub fn new(id: ClientId) -> (Self, mpsc::Receiver<ServerEvent>) {
        Self::with_capacity(id, DEFAULT_CLIENT_QUEUE)
    }

    /// Creates a new client handle with a specific queue capacity.
    pub fn with_capacity(id: ClientId, capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = ClientHandle {
            id,
            tx,
            stats: ClientStats::default(),
        };
        (handle, rx)
    }

    /// Returns the client ID.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Returns a copy of the current statistics.
    pub fn stats(&self) -> ClientStats {
        self.stats.clone()
    }

    /// Queues an event for the connection without waiting.
    ///
    /// Returns false if the queue is full or the connection has gone away.
    pub fn send(&mut self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped += 1;
                tracing::warn!(
                    client_id = %self.id,
                    queued = self.tx.max_capacity(),
                    "Client queue full, disconnecting"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.messages_failed += 1;
                tracing::debug!(client_id = %self.id, "Client channel closed");
                false
            }
        }
    }

    /// Checks if the connection has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
