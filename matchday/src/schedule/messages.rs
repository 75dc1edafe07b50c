//! Schedule engine message and report types.

use super::errors::ScheduleResult;
use super::models::{CategoryId, CompetitorId, Match, MatchId, Slot, VenueId};
use crate::clash::ClashViolation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

type Reply<T> = oneshot::Sender<ScheduleResult<T>>;

/// Messages that can be sent to the schedule engine
#[derive(Debug)]
pub enum ScheduleMessage {
    /// Build a category's bracket and commit its matches
    CommitBracket {
        category: CategoryId,
        response: Reply<BracketReport>,
    },

    /// Search for the earliest clash-free slot
    PlaceMatch {
        match_id: MatchId,
        venue: Option<VenueId>,
        response: Reply<PlacementOutcome>,
    },

    /// Place every eligible pending match
    ScheduleAll { response: Reply<ScheduleReport> },

    /// Move a scheduled match to an explicit slot
    Reschedule {
        match_id: MatchId,
        venue: VenueId,
        start: DateTime<Utc>,
        expected_seq: Option<u64>,
        response: Reply<Slot>,
    },

    /// Operator placement, typically for a deferred match
    ManualPlace {
        match_id: MatchId,
        venue: VenueId,
        start: DateTime<Utc>,
        expected_seq: Option<u64>,
        response: Reply<ManualPlacement>,
    },

    StartMatch {
        match_id: MatchId,
        response: Reply<Match>,
    },

    RecordResult {
        match_id: MatchId,
        winner: CompetitorId,
        response: Reply<ResultReport>,
    },

    CancelMatch {
        match_id: MatchId,
        response: Reply<Match>,
    },

    /// Late withdrawal of a competitor from one category
    Withdraw {
        category: CategoryId,
        competitor: CompetitorId,
        response: Reply<WithdrawReport>,
    },

    /// Matches deferred since their last placement attempt
    ListDeferred {
        response: oneshot::Sender<Vec<DeferredMatch>>,
    },
}

/// Why a match could not be placed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeferReason {
    /// One or both entrants are not known yet
    AwaitingPrerequisites,
    /// Every candidate up to the horizon clashed or had no free venue
    NoSlotWithinHorizon {
        horizon_end: DateTime<Utc>,
        /// Last clash seen during the search, if any
        last_violation: Option<ClashViolation>,
    },
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::AwaitingPrerequisites => write!(f, "awaiting prerequisite matches"),
            DeferReason::NoSlotWithinHorizon {
                horizon_end,
                last_violation: Some(violation),
            } => write!(f, "no slot before {horizon_end}; last clash: {violation}"),
            DeferReason::NoSlotWithinHorizon { horizon_end, .. } => {
                write!(f, "no free venue before {horizon_end}")
            }
        }
    }
}

/// Result of a placement attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum PlacementOutcome {
    Scheduled(Slot),
    Deferred(DeferReason),
}

impl PlacementOutcome {
    pub fn slot(&self) -> Option<&Slot> {
        match self {
            PlacementOutcome::Scheduled(slot) => Some(slot),
            PlacementOutcome::Deferred(_) => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, PlacementOutcome::Deferred(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredMatch {
    pub match_id: MatchId,
    pub reason: DeferReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedMatch {
    pub match_id: MatchId,
    pub slot: Slot,
}

/// Outcome of committing a bracket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketReport {
    pub category: CategoryId,
    pub format: String,
    pub rounds: usize,
    pub matches: usize,
    /// Matches decided by bye while committing
    pub byes: Vec<MatchId>,
    pub seq: u64,
}

/// Outcome of a ScheduleAll pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub placed: Vec<PlacedMatch>,
    pub deferred: Vec<DeferredMatch>,
    pub seq: u64,
}

/// Outcome of an operator placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualPlacement {
    pub match_id: MatchId,
    pub slot: Slot,
    /// Minimum-gap violation accepted by the override, if any
    pub overridden: Option<ClashViolation>,
    pub seq: u64,
}

/// Outcome of a recorded result and everything it triggered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultReport {
    pub match_id: MatchId,
    pub winner: CompetitorId,
    /// Downstream match the winner moved into
    pub advanced_to: Option<MatchId>,
    /// Automatic placement of the downstream match, if attempted
    pub placement: Option<PlacementOutcome>,
    /// Losers-bracket match the loser dropped into (double elimination)
    pub dropped_to: Option<MatchId>,
    /// Set when this result decided the category
    pub champion: Option<CompetitorId>,
    pub seq: u64,
}

/// Outcome of a late withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawReport {
    pub category: CategoryId,
    pub competitor: CompetitorId,
    /// Matches of the competitor that were decided, cancelled or emptied
    pub affected: Vec<MatchId>,
    /// Downstream matches that received an entrant as a consequence
    pub advanced: Vec<MatchId>,
    pub seq: u64,
}
