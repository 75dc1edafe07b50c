//! Schedule engine error types.

use super::models::{CategoryId, CompetitorId, MatchId, MatchState, VenueId};
use crate::bracket::BracketError;
use crate::clash::ClashViolation;
use crate::mutation::LogError;
use crate::registry::RegistryError;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Schedule engine errors.
///
/// Every variant fails a single operation; none of them stops the engine.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Clash: {0}")]
    Clash(ClashViolation),

    #[error("Venue {venue} is occupied by match {occupant}")]
    VenueOccupied { venue: VenueId, occupant: MatchId },

    #[error(
        "Match {match_id} was modified at seq {committed_seq}, after expected seq {expected_seq}"
    )]
    ConcurrentWriteConflict {
        match_id: MatchId,
        committed_seq: u64,
        expected_seq: u64,
    },

    #[error("Invalid result for match {match_id}: {reason}")]
    InvalidResult { match_id: MatchId, reason: String },

    #[error("Match {match_id} cannot go from {from} to {to}")]
    InvalidTransition {
        match_id: MatchId,
        from: MatchState,
        to: MatchState,
    },

    #[error("Match {0} is still waiting for its entrants")]
    AwaitingEntrants(MatchId),

    #[error("Start time {0} leaves no room for a match")]
    StartOutOfRange(DateTime<Utc>),

    #[error("Bracket for category {0} already exists")]
    BracketExists(CategoryId),

    #[error("Unknown match: {0}")]
    UnknownMatch(MatchId),

    #[error("Unknown venue: {0}")]
    UnknownVenue(VenueId),

    #[error("Competitor {competitor} is not registered in category {category}")]
    UnknownCompetitor {
        category: CategoryId,
        competitor: CompetitorId,
    },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Bracket error: {0}")]
    Bracket(#[from] BracketError),

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("Schedule engine is not running")]
    EngineClosed,

    #[error("Mutation log error: {0}")]
    Log(#[from] LogError),
}

impl ScheduleError {
    /// Message safe to show to operators and officials
    pub fn client_message(&self) -> String {
        match self {
            ScheduleError::Log(_) => "Internal storage error".to_string(),
            ScheduleError::Registry(RegistryError::Io(_) | RegistryError::Parse(_)) => {
                "Registry unavailable".to_string()
            }
            ScheduleError::Bracket(BracketError::Registry(
                RegistryError::Io(_) | RegistryError::Parse(_),
            )) => "Registry unavailable".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the target of the operation does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ScheduleError::UnknownMatch(_)
                | ScheduleError::UnknownVenue(_)
                | ScheduleError::UnknownCompetitor { .. }
                | ScheduleError::Registry(
                    RegistryError::CategoryNotFound(_) | RegistryError::CompetitorNotFound(_)
                )
                | ScheduleError::Bracket(BracketError::Registry(
                    RegistryError::CategoryNotFound(_) | RegistryError::CompetitorNotFound(_)
                ))
        )
    }
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;
