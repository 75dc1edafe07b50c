//! Clash detection for proposed placements.
//!
//! A clash is a competitor being required in two matches that overlap or
//! sit closer together than the minimum gap. Detection is a pure function of
//! a schedule snapshot and may run on any thread.

use crate::schedule::models::{CategoryId, CompetitorId, Match, MatchId, Slot, duration_secs};
use crate::schedule::state::ScheduleState;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Minimum separation required between matches sharing a competitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapPolicy {
    default: TimeDelta,
    per_category: BTreeMap<CategoryId, TimeDelta>,
}

impl GapPolicy {
    /// Same gap for every category
    pub fn uniform(gap: TimeDelta) -> Self {
        Self {
            default: gap,
            per_category: BTreeMap::new(),
        }
    }

    /// Override the gap for one category
    pub fn with_category(mut self, category: CategoryId, gap: TimeDelta) -> Self {
        self.per_category.insert(category, gap);
        self
    }

    pub fn gap_for(&self, category: CategoryId) -> TimeDelta {
        self.per_category
            .get(&category)
            .copied()
            .unwrap_or(self.default)
    }

    /// Gap required between a match of `a` and a match of `b`; the stricter
    /// category wins
    pub fn required_between(&self, a: CategoryId, b: CategoryId) -> TimeDelta {
        self.gap_for(a).max(self.gap_for(b))
    }
}

/// The most binding conflict found for a proposed placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClashViolation {
    pub conflicting_match: MatchId,
    pub competitor: CompetitorId,
    #[serde(with = "duration_secs")]
    pub required_gap: TimeDelta,
    /// Distance between the two intervals; for overlapping intervals this is
    /// the length of the overlap
    #[serde(with = "duration_secs")]
    pub actual_gap: TimeDelta,
    /// The competitor would be in both matches at the same instant
    pub overlapping: bool,
}

impl ClashViolation {
    /// Only the minimum-gap heuristic is violated; the intervals themselves
    /// are disjoint
    pub fn is_soft(&self) -> bool {
        !self.overlapping
    }
}

impl fmt::Display for ClashViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.overlapping {
            write!(
                f,
                "competitor {} already plays match {} (overlap {} min)",
                self.competitor,
                self.conflicting_match,
                self.actual_gap.num_minutes()
            )
        } else {
            write!(
                f,
                "competitor {} plays match {} only {} min apart (required {} min)",
                self.competitor,
                self.conflicting_match,
                self.actual_gap.num_minutes(),
                self.required_gap.num_minutes()
            )
        }
    }
}

/// Result of [`check_placement`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClashCheck {
    Ok,
    Violation(ClashViolation),
}

impl ClashCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, ClashCheck::Ok)
    }

    pub fn into_result(self) -> Result<(), ClashViolation> {
        match self {
            ClashCheck::Ok => Ok(()),
            ClashCheck::Violation(v) => Err(v),
        }
    }
}

/// Signed separation between two intervals: negative when they overlap
pub fn signed_gap(proposed: &Slot, existing: &Slot) -> TimeDelta {
    if proposed.start >= existing.start {
        proposed.start - existing.end
    } else {
        existing.start - proposed.end
    }
}

/// Check whether placing `candidate` into `slot` clashes with any match
/// already occupying a slot in `schedule`.
///
/// Every match sharing a competitor is considered, in any category; the
/// candidate's own current placement is ignored so rescheduling can be
/// checked with the same call. When several matches violate the gap the
/// tightest one is returned.
pub fn check_placement(
    candidate: &Match,
    slot: &Slot,
    schedule: &ScheduleState,
    policy: &GapPolicy,
) -> ClashCheck {
    let mut worst: Option<(TimeDelta, ClashViolation)> = None;

    for competitor in candidate.competitors() {
        for existing in schedule.matches_of(competitor) {
            if existing.id == candidate.id {
                continue;
            }
            let Some(existing_slot) = existing.occupied_slot() else {
                continue;
            };

            let gap = signed_gap(slot, existing_slot);
            let required = policy.required_between(candidate.category(), existing.category());
            if gap >= required {
                continue;
            }

            let tighter = match &worst {
                None => true,
                Some((worst_gap, worst_v)) => {
                    gap < *worst_gap
                        || (gap == *worst_gap
                            && (existing.id, competitor)
                                < (worst_v.conflicting_match, worst_v.competitor))
                }
            };
            if tighter {
                worst = Some((
                    gap,
                    ClashViolation {
                        conflicting_match: existing.id,
                        competitor,
                        required_gap: required,
                        actual_gap: gap.abs(),
                        overlapping: gap < TimeDelta::zero(),
                    },
                ));
            }
        }
    }

    match worst {
        Some((_, violation)) => ClashCheck::Violation(violation),
        None => ClashCheck::Ok,
    }
}
