//! Schedule state as a fold over mutation records.
//!
//! [`ScheduleState`] is never the source of truth: it is a cache derived
//! from the mutation log and can always be rebuilt with
//! [`ScheduleState::replay`].

use super::models::{CategoryId, CompetitorId, Match, MatchId, Slot, VenueId};
use crate::mutation::{LogError, LogResult, MutationRecord};
use std::collections::{BTreeMap, BTreeSet};

/// Folded schedule at a given log version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleState {
    /// Sequence number of the last applied record (0 = empty)
    seq: u64,
    matches: BTreeMap<MatchId, Match>,
    /// Sequence number of the latest record touching each match
    last_modified: BTreeMap<MatchId, u64>,
    by_competitor: BTreeMap<CompetitorId, BTreeSet<MatchId>>,
}

impl ScheduleState {
    /// Empty state at version 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold records from empty state
    pub fn replay<'a>(records: impl IntoIterator<Item = &'a MutationRecord>) -> LogResult<Self> {
        let mut state = Self::new();
        for record in records {
            state.apply(record)?;
        }
        Ok(state)
    }

    /// Apply the next record.
    ///
    /// Fails without modifying the state if the record is not the immediate
    /// successor of the current version, or if its `old` snapshot does not
    /// match what this state holds.
    pub fn apply(&mut self, record: &MutationRecord) -> LogResult<()> {
        let expected = self.seq + 1;
        if record.seq != expected {
            return Err(LogError::SequenceGap {
                expected,
                found: record.seq,
            });
        }

        if self.matches.get(&record.match_id) != record.old.as_ref() {
            return Err(LogError::Diverged {
                seq: record.seq,
                match_id: record.match_id,
            });
        }

        if let Some(old) = &record.old {
            for competitor in old.competitors() {
                if let Some(ids) = self.by_competitor.get_mut(&competitor) {
                    ids.remove(&old.id);
                }
            }
        }
        for competitor in record.new.competitors() {
            self.by_competitor
                .entry(competitor)
                .or_default()
                .insert(record.match_id);
        }

        self.matches.insert(record.match_id, record.new.clone());
        self.last_modified.insert(record.match_id, record.seq);
        self.seq = record.seq;
        Ok(())
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn get(&self, id: &MatchId) -> Option<&Match> {
        self.matches.get(id)
    }

    pub fn contains(&self, id: &MatchId) -> bool {
        self.matches.contains_key(id)
    }

    /// All matches in id order
    pub fn matches(&self) -> impl Iterator<Item = &Match> {
        self.matches.values()
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Sequence number of the latest record that touched `id`
    pub fn last_modified(&self, id: &MatchId) -> Option<u64> {
        self.last_modified.get(id).copied()
    }

    /// Matches (any state) in which `competitor` is a known entrant
    pub fn matches_of(&self, competitor: CompetitorId) -> impl Iterator<Item = &Match> {
        self.by_competitor
            .get(&competitor)
            .into_iter()
            .flatten()
            .filter_map(|id| self.matches.get(id))
    }

    pub fn category_matches(&self, category: CategoryId) -> impl Iterator<Item = &Match> {
        self.matches
            .range(MatchId::new(category, 0, 0)..=MatchId::new(category, u32::MAX, u32::MAX))
            .map(|(_, m)| m)
    }

    /// Match other than `exclude` physically occupying `venue` during `slot`
    pub fn venue_occupant(&self, venue: VenueId, slot: &Slot, exclude: &MatchId) -> Option<&Match> {
        self.matches.values().find(|m| {
            m.id != *exclude
                && m.occupied_slot()
                    .is_some_and(|s| s.venue == venue && s.overlaps(slot))
        })
    }

    /// Matches feeding their winner or loser into `id`
    pub fn feeders_of(&self, id: &MatchId) -> Vec<&Match> {
        if id.round <= 1 {
            return Vec::new();
        }
        self.category_matches(id.category)
            .filter(|m| {
                [m.next, m.loser_next]
                    .into_iter()
                    .flatten()
                    .any(|adv| adv.match_id == *id)
            })
            .collect()
    }
}
