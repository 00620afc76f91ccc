//! Push channel connection state.

use std::sync::atomic::{AtomicU32, Ordering};

/// State of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, waiting to retry.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected; re-polling every kind before reading deltas.
    Resyncing,
    /// Connected and applying deltas.
    Live,
    /// The ingestor has exited.
    Stopped,
}

impl ConnectionState {
    /// Whether deltas are currently being applied.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }
}

/// Atomic wrapper for connection state.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU32);

impl AtomicConnectionState {
    /// Create a new atomic state.
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    /// Load the current state.
    #[must_use]
    pub fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Resyncing,
            3 => ConnectionState::Live,
            _ => ConnectionState::Stopped,
        }
    }

    /// Store a new state.
    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u32, Ordering::SeqCst);
    }
}

impl Default for AtomicConnectionState {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}
