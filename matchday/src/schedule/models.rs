//! Schedule data models: matches, entrants, slots and venues.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Competitor ID type
pub type CompetitorId = i64;

/// Category ID type
pub type CategoryId = i64;

/// Venue (mat, court, ring) ID type
pub type VenueId = u32;

/// Stable match identity: owning category, round (1-indexed) and position
/// within the round (0-indexed).
///
/// Rendered as `"{category}-{round}-{position}"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MatchId {
    pub category: CategoryId,
    pub round: u32,
    pub position: u32,
}

impl MatchId {
    /// Create a new match ID
    pub fn new(category: CategoryId, round: u32, position: u32) -> Self {
        Self {
            category,
            round,
            position,
        }
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.category, self.round, self.position)
    }
}

impl FromStr for MatchId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let (Some(category), Some(round), Some(position), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("Invalid match id: {s}"));
        };

        let parse_err = |_| format!("Invalid match id: {s}");
        Ok(Self {
            category: category.parse().map_err(parse_err)?,
            round: round.parse().map_err(parse_err)?,
            position: position.parse().map_err(parse_err)?,
        })
    }
}

impl From<MatchId> for String {
    fn from(id: MatchId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for MatchId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One side of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Entrant {
    /// A known competitor
    Competitor(CompetitorId),
    /// No opponent; the other side advances without play
    Bye,
    /// Filled in later by the winner of a prerequisite match
    Awaiting,
}

impl Entrant {
    /// Competitor ID if this side is a known competitor
    pub fn competitor(&self) -> Option<CompetitorId> {
        match self {
            Entrant::Competitor(id) => Some(*id),
            _ => None,
        }
    }
}

/// Where the winner of a match goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Advance {
    pub match_id: MatchId,
    /// Entrant index (0 or 1) in the downstream match
    pub side: usize,
}

/// Match lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    Pending,
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl MatchState {
    /// Whether an officiated transition from `self` to `next` is legal.
    ///
    /// Byes and walkovers resolve `Pending`/`Scheduled` straight to
    /// `Completed`; those go through [`MatchState::can_resolve_without_play`].
    pub fn can_transition_to(self, next: MatchState) -> bool {
        use MatchState::*;
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Scheduled, Scheduled)
                | (Scheduled, InProgress)
                | (Scheduled, Completed)
                | (InProgress, Completed)
                | (Pending, Cancelled)
                | (Scheduled, Cancelled)
        )
    }

    /// Whether a match in this state may still be decided by bye or walkover
    pub fn can_resolve_without_play(self) -> bool {
        matches!(
            self,
            MatchState::Pending | MatchState::Scheduled | MatchState::InProgress
        )
    }

    /// Whether the match is finished one way or another
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchState::Completed | MatchState::Cancelled)
    }
}

impl fmt::Display for MatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchState::Pending => write!(f, "pending"),
            MatchState::Scheduled => write!(f, "scheduled"),
            MatchState::InProgress => write!(f, "in_progress"),
            MatchState::Completed => write!(f, "completed"),
            MatchState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a completed match was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Played,
    Bye,
    Walkover,
}

/// A (venue, time interval) placement. The interval is half-open: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub venue: VenueId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Slot {
    /// Create a slot of the given length.
    ///
    /// # Panics
    ///
    /// If the end falls outside the representable time range; use
    /// [`Slot::try_new`] for untrusted start times.
    pub fn new(venue: VenueId, start: DateTime<Utc>, duration: TimeDelta) -> Self {
        Self {
            venue,
            start,
            end: start + duration,
        }
    }

    /// Create a slot of the given length, or `None` if its end is not a
    /// representable time
    pub fn try_new(venue: VenueId, start: DateTime<Utc>, duration: TimeDelta) -> Option<Self> {
        let end = start.checked_add_signed(duration)?;
        Some(Self { venue, start, end })
    }

    /// Whether two intervals share an instant (regardless of venue)
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }
}

/// A venue in the finite resource pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Venue {
    pub id: VenueId,
    pub name: String,
}

impl Venue {
    pub fn new(id: VenueId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A single match in a category's bracket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub id: MatchId,
    pub entrants: [Entrant; 2],
    /// Downstream match fed by this match's winner (elimination only)
    pub next: Option<Advance>,
    /// Losers-bracket match fed by this match's loser (double elimination)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loser_next: Option<Advance>,
    pub slot: Option<Slot>,
    pub state: MatchState,
    pub winner: Option<CompetitorId>,
    pub outcome: Option<Outcome>,
}

impl Match {
    /// Create a pending, unscheduled match
    pub fn new(id: MatchId, entrants: [Entrant; 2], next: Option<Advance>) -> Self {
        Self {
            id,
            entrants,
            next,
            loser_next: None,
            slot: None,
            state: MatchState::Pending,
            winner: None,
            outcome: None,
        }
    }

    pub fn category(&self) -> CategoryId {
        self.id.category
    }

    pub fn round(&self) -> u32 {
        self.id.round
    }

    /// Known competitors in this match
    pub fn competitors(&self) -> impl Iterator<Item = CompetitorId> + '_ {
        self.entrants.iter().filter_map(Entrant::competitor)
    }

    pub fn involves(&self, competitor: CompetitorId) -> bool {
        self.competitors().any(|c| c == competitor)
    }

    /// Both sides are known competitors, so the match can be played
    pub fn has_both_competitors(&self) -> bool {
        self.entrants.iter().all(|e| e.competitor().is_some())
    }

    /// Pending and ready to be placed
    pub fn is_eligible(&self) -> bool {
        self.state == MatchState::Pending && self.has_both_competitors()
    }

    /// The opponent of `competitor`, if known
    pub fn opponent_of(&self, competitor: CompetitorId) -> Option<Entrant> {
        match self.entrants {
            [Entrant::Competitor(a), other] if a == competitor => Some(other),
            [other, Entrant::Competitor(b)] if b == competitor => Some(other),
            _ => None,
        }
    }

    /// The side knocked out of a decided match; a bye when nobody lost
    pub fn loser(&self) -> Entrant {
        self.winner
            .and_then(|winner| self.opponent_of(winner))
            .filter(|e| e.competitor().is_some())
            .unwrap_or(Entrant::Bye)
    }

    /// Slot that physically occupies a venue and competitors' time.
    ///
    /// Cancelled matches release their slot; completed ones keep occupying
    /// the interval they were played in.
    pub fn occupied_slot(&self) -> Option<&Slot> {
        match self.state {
            MatchState::Scheduled | MatchState::InProgress | MatchState::Completed => {
                self.slot.as_ref()
            }
            MatchState::Pending | MatchState::Cancelled => None,
        }
    }
}

/// Serialize a [`TimeDelta`] as whole seconds.
pub mod duration_secs {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        TimeDelta::try_seconds(secs).ok_or_else(|| D::Error::custom("duration out of range"))
    }
}

/// Serialize an optional [`TimeDelta`] as whole seconds.
pub mod option_duration_secs {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        value: &Option<TimeDelta>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(delta) => serializer.serialize_some(&delta.num_seconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<TimeDelta>, D::Error> {
        match Option::<i64>::deserialize(deserializer)? {
            Some(secs) => TimeDelta::try_seconds(secs)
                .map(Some)
                .ok_or_else(|| D::Error::custom("duration out of range")),
            None => Ok(None),
        }
    }
}
