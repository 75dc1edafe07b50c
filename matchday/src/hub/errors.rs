//! Realtime hub error types.

use super::connection::{ConnectionEvent, ConnectionState};
use thiserror::Error;

/// Realtime hub errors
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid hub configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown client: {0}")]
    UnknownClient(String),

    #[error("Invalid connection transition: {event} while {from}")]
    InvalidTransition {
        from: ConnectionState,
        event: ConnectionEvent,
    },

    #[error("Client {0} exceeded its delivery backlog; resync required")]
    BacklogExceeded(String),

    #[error("Client {0} fell out of sequence; resync required")]
    SequenceBroken(String),

    #[error("Client {0} is disconnected")]
    Disconnected(String),
}

impl HubError {
    /// Whether the client should reconnect and backfill
    pub fn should_reconnect(&self) -> bool {
        matches!(
            self,
            HubError::BacklogExceeded(_) | HubError::SequenceBroken(_) | HubError::Disconnected(_)
        )
    }
}

pub type HubResult<T> = Result<T, HubError>;
