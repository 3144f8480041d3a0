//! Bounded replay buffer for session output.
//!
//! Keeps the most recent bytes a session's process emitted so a newly
//! subscribing observer can rebuild the screen without having seen earlier
//! events. Oldest bytes are evicted first once the capacity is exceeded.

use std::collections::VecDeque;

/// Default capacity shared by all sessions (50 KiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 50 * 1024;

/// Ring buffer of raw output bytes.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    frozen: bool,
}

impl OutputBuffer {
    /// Creates an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            frozen: false,
        }
    }

    /// Appends bytes, evicting from the front to stay within capacity.
    ///
    /// Returns false and leaves the buffer untouched when it is frozen.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if self.frozen {
            return false;
        }

        // Only the tail of an oversized chunk can survive.
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };

        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.data.drain(..overflow);
        }
        self.data.extend(bytes.iter().copied());
        true
    }

    /// Stops accepting appends. Used once the session is completed.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Returns whether the buffer has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Copies the buffered bytes.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }

    /// Returns the buffered output as text for replay.
    ///
    /// Eviction can cut a multi-byte character in half; orphaned continuation
    /// bytes at the front are skipped and anything else that is not valid
    /// UTF-8 is replaced.
    pub fn snapshot_text(&self) -> String {
        let bytes = self.snapshot();
        let start = bytes
            .iter()
            .take(3)
            .take_while(|b| (**b & 0b1100_0000) == 0b1000_0000)
            .count();
        String::from_utf8_lossy(&bytes[start..]).into_owned()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum number of bytes kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
