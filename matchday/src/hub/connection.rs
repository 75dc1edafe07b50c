//! Per-client connection state machine.
//!
//! ```text
//!            connect
//!               |
//!               v
//!   +----> Connecting --synced--> Live <--heartbeat
//!   |           |                  |
//!   |           +--timeout/lost----+---> Reconnecting
//!   |                                        |
//!   +--reconnect-- Disconnected <--grace-----+
//!                       ^
//!                       +-- close / backlog exceeded (from any connected state)
//! ```

use super::errors::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of one client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Attached, backfill not yet delivered
    Connecting,
    /// Receiving live records
    Live,
    /// Connection lost; state kept for a reconnect grace period
    Reconnecting,
    Disconnected,
}

/// Events that move a client between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    Synced,
    Heartbeat,
    HeartbeatTimeout,
    /// Transport went away without a close
    ConnectionLost,
    GraceExpired,
    Close,
    BacklogExceeded,
    Reconnect,
}

impl ConnectionState {
    /// State of a brand-new connection
    pub fn connect() -> Self {
        ConnectionState::Connecting
    }

    /// Apply an event
    pub fn on(self, event: ConnectionEvent) -> HubResult<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (self, event) {
            (S::Connecting, E::Synced) => S::Live,
            (S::Connecting | S::Live, E::Heartbeat) => self,
            (S::Connecting | S::Live, E::HeartbeatTimeout | E::ConnectionLost) => S::Reconnecting,
            (S::Reconnecting, E::GraceExpired) => S::Disconnected,
            (S::Connecting | S::Live | S::Reconnecting, E::Close) => S::Disconnected,
            (S::Connecting | S::Live, E::BacklogExceeded) => S::Disconnected,
            (S::Reconnecting | S::Disconnected, E::Reconnect) => S::Connecting,
            (from, event) => return Err(HubError::InvalidTransition { from, event }),
        };
        Ok(next)
    }

    /// Whether records are being delivered
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Live)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Live => write!(f, "live"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionEvent::Synced => "synced",
            ConnectionEvent::Heartbeat => "heartbeat",
            ConnectionEvent::HeartbeatTimeout => "heartbeat_timeout",
            ConnectionEvent::ConnectionLost => "connection_lost",
            ConnectionEvent::GraceExpired => "grace_expired",
            ConnectionEvent::Close => "close",
            ConnectionEvent::BacklogExceeded => "backlog_exceeded",
            ConnectionEvent::Reconnect => "reconnect",
        };
        f.write_str(name)
    }
}
