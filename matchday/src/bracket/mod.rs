//! Bracket construction for a category.
//!
//! Bracket formats are a tagged variant ([`BracketType`]) dispatched through
//! the [`BracketFormat`] trait with `enum_dispatch`. Adding a format means
//! adding a variant and its layout, nothing else.
//!
//! Building is pure: identical competitors, seeds and draw seed always
//! produce an identical bracket.
//!
//! ## Example
//!
//! ```
//! use matchday::bracket::{BracketType, Elimination, layout};
//!
//! let format: BracketType = Elimination {}.into();
//! let bracket = layout(1, format, vec![11, 12, 13, 14, 15]);
//! assert_eq!(bracket.round_count(), 3);
//! ```

pub mod double_elimination;
pub mod elimination;
pub mod round_robin;

pub use double_elimination::DoubleElimination;
pub use elimination::Elimination;
pub use round_robin::RoundRobin;

use crate::registry::{Category, Registry, RegistryError};
use crate::schedule::models::{CategoryId, CompetitorId, Match};
use enum_dispatch::enum_dispatch;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bracket building errors
#[derive(Debug, Error)]
pub enum BracketError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type BracketResult<T> = Result<T, BracketError>;

/// Layout strategy for one bracket format
#[enum_dispatch]
pub trait BracketFormat {
    /// Lay out matches for entrants already in seed order (index 0 is the
    /// top seed). Returns matches grouped by round, round 1 first.
    fn layout_rounds(&self, category: CategoryId, entrants: &[CompetitorId]) -> Vec<Vec<Match>>;

    /// Short format name used in logs
    fn name(&self) -> &'static str;
}

/// Supported bracket formats
#[enum_dispatch(BracketFormat)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BracketType {
    Elimination(Elimination),
    DoubleElimination(DoubleElimination),
    RoundRobin(RoundRobin),
}

impl BracketType {
    /// Whether winners advance into later rounds
    pub fn is_elimination(&self) -> bool {
        matches!(
            self,
            BracketType::Elimination(_) | BracketType::DoubleElimination(_)
        )
    }
}

/// A built bracket: matches grouped by round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bracket {
    pub category: CategoryId,
    pub format: BracketType,
    /// Competitors in final seed order
    pub entrants: Vec<CompetitorId>,
    pub rounds: Vec<Vec<Match>>,
}

impl Bracket {
    pub fn round_count(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// All matches, round by round
    pub fn matches(&self) -> impl Iterator<Item = &Match> {
        self.rounds.iter().flatten()
    }

    pub fn match_count(&self) -> usize {
        self.rounds.iter().map(Vec::len).sum()
    }
}

/// Build the bracket for a category from registry data.
///
/// A category with fewer than two competitors yields an empty bracket.
pub fn build(category: &Category, registry: &dyn Registry) -> BracketResult<Bracket> {
    let roster = registry.competitors(category.id)?;
    let seeded: Vec<(CompetitorId, Option<u32>)> = roster
        .iter()
        .map(|c| (c.id, registry.seed(c.id)))
        .collect();

    let entrants = seed_order(&seeded, category.draw_seed);
    let bracket = layout(category.id, category.bracket.clone(), entrants);

    if bracket.is_empty() {
        log::warn!(
            "Category {} '{}' has {} competitor(s); bracket is empty",
            category.id,
            category.name,
            bracket.entrants.len()
        );
    } else {
        log::info!(
            "Built {} bracket for category {} '{}': {} rounds, {} matches",
            bracket.format.name(),
            category.id,
            category.name,
            bracket.round_count(),
            bracket.match_count()
        );
    }

    Ok(bracket)
}

/// Lay out a bracket for entrants already in seed order
pub fn layout(category: CategoryId, format: BracketType, entrants: Vec<CompetitorId>) -> Bracket {
    let rounds = if entrants.len() < 2 {
        Vec::new()
    } else {
        format.layout_rounds(category, &entrants)
    };

    Bracket {
        category,
        format,
        entrants,
        rounds,
    }
}

/// Order competitors for the draw.
///
/// Seeded competitors come first by ascending seed (ties keep registration
/// order). Unseeded competitors follow in registration order, or shuffled
/// with `draw_seed` when one is supplied.
pub fn seed_order(
    competitors: &[(CompetitorId, Option<u32>)],
    draw_seed: Option<u64>,
) -> Vec<CompetitorId> {
    let mut seeded: Vec<(u32, usize, CompetitorId)> = competitors
        .iter()
        .enumerate()
        .filter_map(|(idx, (id, seed))| seed.map(|s| (s, idx, *id)))
        .collect();
    seeded.sort();

    let mut unseeded: Vec<CompetitorId> = competitors
        .iter()
        .filter(|(_, seed)| seed.is_none())
        .map(|(id, _)| *id)
        .collect();

    if let Some(seed) = draw_seed {
        let mut rng = StdRng::seed_from_u64(seed);
        unseeded.shuffle(&mut rng);
    }

    seeded
        .into_iter()
        .map(|(_, _, id)| id)
        .chain(unseeded)
        .collect()
}
