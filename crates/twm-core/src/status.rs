use std::{collections::HashMap, fmt, sync::RwLock};

use crate::domain::SessionId;

/// Connection lifecycle state of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Uninitialized,
    Pairing,
    Connecting,
    Open,
    /// Terminal: the controller has to delete and recreate the session.
    ClosedFatal,
    /// No live connection (start failed, or nothing has been started).
    Offline,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Pairing => "pairing",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::ClosedFatal => "closed",
            ConnectionState::Offline => "offline",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory session id → last known state. Not persisted.
///
/// Uses a synchronous lock so a transition is visible to readers before the
/// caller awaits anything else.
#[derive(Default)]
pub struct StatusTracker {
    inner: RwLock<HashMap<SessionId, ConnectionState>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: &SessionId, state: ConnectionState) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(id.clone(), state);
    }

    pub fn get(&self, id: &SessionId) -> Option<ConnectionState> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(id).copied()
    }

    /// Status string for display; `"unknown"` when nothing was tracked.
    pub fn label(&self, id: &SessionId) -> &'static str {
        self.get(id).map(|s| s.as_str()).unwrap_or("unknown")
    }

    pub fn remove(&self, id: &SessionId) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(id);
    }
}
