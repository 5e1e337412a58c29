//! Connection state machine (spec §3).
//!
//! Six states classified along three axes: transitional vs. stable, whether
//! client operations may be issued, and whether the transport holds a live
//! socket. `READY` is the only state that is stable, operational, and has a
//! socket simultaneously.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Initializing,
    Ready,
    Error,
}

impl ConnectionState {
    /// A state is transitional if it is expected to move on its own
    /// (without external input) to some other state.
    pub fn is_transitional(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Initializing)
    }

    /// The complement of `is_transitional`. Every state is exactly one of
    /// the two.
    pub fn is_stable(self) -> bool {
        !self.is_transitional()
    }

    /// Only `READY` accepts typed client operations.
    pub fn can_perform_operations(self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// Whether the transport is expected to hold a live child-process
    /// socket in this state.
    pub fn has_socket(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Initializing | ConnectionState::Ready
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}
