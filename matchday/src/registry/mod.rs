//! Read-only adapter over externally owned athlete and category data.
//!
//! Registration happens elsewhere; the scheduler only ever reads competitor
//! identity, category membership and seeding through the [`Registry`] trait.

use crate::bracket::BracketType;
use crate::schedule::models::{CategoryId, CompetitorId, option_duration_secs};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Category not found: {0}")]
    CategoryNotFound(CategoryId),

    #[error("Competitor not found: {0}")]
    CompetitorNotFound(CompetitorId),

    #[error("Inconsistent registry data: {0}")]
    Inconsistent(String),

    #[error("Failed to read registry file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse registry data: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A registered competitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competitor {
    pub id: CompetitorId,
    pub name: String,
    /// Ranking seed (1 = strongest), if any
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default)]
    pub categories: BTreeSet<CategoryId>,
}

/// A competition category (e.g. "U18 Kumite -60kg")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    /// Registered competitors in registration order
    pub competitors: Vec<CompetitorId>,
    pub bracket: BracketType,
    /// Draw seed for shuffling unseeded competitors; `None` keeps registration order
    #[serde(default)]
    pub draw_seed: Option<u64>,
    /// Overrides the scheduler's default match duration
    #[serde(default, with = "option_duration_secs")]
    pub match_duration: Option<TimeDelta>,
    /// Overrides the scheduler's default minimum gap
    #[serde(default, with = "option_duration_secs")]
    pub min_gap: Option<TimeDelta>,
}

/// Read-only view over registration data.
///
/// Implementations must return consistent answers for the duration of a
/// single bracket build.
pub trait Registry: Send + Sync {
    fn category(&self, id: CategoryId) -> RegistryResult<Category>;

    fn categories(&self) -> Vec<Category>;

    fn competitor(&self, id: CompetitorId) -> RegistryResult<Competitor>;

    /// Competitors of a category in registration order
    fn competitors(&self, category: CategoryId) -> RegistryResult<Vec<Competitor>> {
        let category = self.category(category)?;
        category
            .competitors
            .iter()
            .map(|id| self.competitor(*id))
            .collect()
    }

    fn seed(&self, competitor: CompetitorId) -> Option<u32> {
        self.competitor(competitor).ok().and_then(|c| c.seed)
    }
}

/// Serialized registry contents, as exported by the registration system
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryData {
    pub competitors: Vec<Competitor>,
    pub categories: Vec<Category>,
}

/// In-memory registry loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    competitors: HashMap<CompetitorId, Competitor>,
    categories: HashMap<CategoryId, Category>,
}

impl InMemoryRegistry {
    /// Build a registry, checking that category rosters and competitor
    /// memberships agree
    pub fn new(data: RegistryData) -> RegistryResult<Self> {
        let competitors: HashMap<_, _> = data
            .competitors
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        let mut categories = HashMap::with_capacity(data.categories.len());
        for category in data.categories {
            let mut seen = BTreeSet::new();
            for id in &category.competitors {
                let competitor = competitors
                    .get(id)
                    .ok_or(RegistryError::CompetitorNotFound(*id))?;
                if !competitor.categories.contains(&category.id) {
                    return Err(RegistryError::Inconsistent(format!(
                        "competitor {} is listed in category {} but not a member of it",
                        id, category.id
                    )));
                }
                if !seen.insert(*id) {
                    return Err(RegistryError::Inconsistent(format!(
                        "competitor {} registered twice in category {}",
                        id, category.id
                    )));
                }
            }
            if categories.insert(category.id, category).is_some() {
                return Err(RegistryError::Inconsistent(
                    "duplicate category id".to_string(),
                ));
            }
        }

        Ok(Self {
            competitors,
            categories,
        })
    }

    /// Load registry data from a JSON export
    pub fn from_json_file(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let data: RegistryData = serde_json::from_str(&raw)?;
        Self::new(data)
    }
}

impl Registry for InMemoryRegistry {
    fn category(&self, id: CategoryId) -> RegistryResult<Category> {
        self.categories
            .get(&id)
            .cloned()
            .ok_or(RegistryError::CategoryNotFound(id))
    }

    fn categories(&self) -> Vec<Category> {
        let mut categories: Vec<_> = self.categories.values().cloned().collect();
        categories.sort_by_key(|c| c.id);
        categories
    }

    fn competitor(&self, id: CompetitorId) -> RegistryResult<Competitor> {
        self.competitors
            .get(&id)
            .cloned()
            .ok_or(RegistryError::CompetitorNotFound(id))
    }
}
