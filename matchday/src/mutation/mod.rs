//! Append-only, versioned record of every schedule change.
//!
//! The log is the single source of truth: the current schedule is a fold
//! over its records. A single [`LogWriter`] appends; any number of readers
//! take snapshots, replay suffixes or attach to the live stream.

pub mod journal;
pub mod store;

pub use journal::{Attachment, Backfill, LogWriter, MutationLog};
pub use store::{LogStore, MemoryLogStore};

use crate::schedule::models::{Match, MatchId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Mutation log errors
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("Record {seq} does not match stored state of match {match_id}")]
    Diverged { seq: u64, match_id: MatchId },

    #[error("Sequence {requested} is older than retained history (first retained {first_retained})")]
    ReplayGap { requested: u64, first_retained: u64 },

    #[error("Sequence {requested} is ahead of the log head {head}")]
    AheadOfHead { requested: u64, head: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LogError {
    /// Whether a subscriber must fall back to a full snapshot
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            LogError::ReplayGap { .. } | LogError::AheadOfHead { .. }
        )
    }
}

impl From<sqlx::Error> for LogError {
    fn from(err: sqlx::Error) -> Self {
        LogError::Storage(err.to_string())
    }
}

pub type LogResult<T> = Result<T, LogError>;

/// Why a match changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCause {
    /// Match created by a bracket build
    BracketBuilt,
    /// Placed by the engine's slot search
    Placed,
    /// Placed by an operator
    ManualPlaced,
    Rescheduled,
    Started,
    ResultRecorded,
    /// An upstream winner filled one of the entrant slots
    Advanced,
    /// Decided without play (bye or walkover)
    Resolved,
    Cancelled,
    Withdrawn,
}

impl fmt::Display for ChangeCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeCause::BracketBuilt => "bracket_built",
            ChangeCause::Placed => "placed",
            ChangeCause::ManualPlaced => "manual_placed",
            ChangeCause::Rescheduled => "rescheduled",
            ChangeCause::Started => "started",
            ChangeCause::ResultRecorded => "result_recorded",
            ChangeCause::Advanced => "advanced",
            ChangeCause::Resolved => "resolved",
            ChangeCause::Cancelled => "cancelled",
            ChangeCause::Withdrawn => "withdrawn",
        };
        f.write_str(name)
    }
}

/// One committed change to one match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Gapless, strictly increasing, starting at 1
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub match_id: MatchId,
    /// State before the change; `None` when the match was created
    pub old: Option<Match>,
    pub new: Match,
    pub cause: ChangeCause,
}
