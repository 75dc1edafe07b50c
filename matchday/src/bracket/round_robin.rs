//! Round-robin layout using the circle method.
//!
//! Every unordered pair of competitors meets exactly once. Pairs are
//! grouped into rounds in which nobody plays twice; the engine is still
//! free to place them in any order.

use super::BracketFormat;
use crate::schedule::models::{CategoryId, CompetitorId, Entrant, Match, MatchId};
use serde::{Deserialize, Serialize};

/// Round-robin pool; everyone meets everyone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRobin {}

impl BracketFormat for RoundRobin {
    fn layout_rounds(&self, category: CategoryId, entrants: &[CompetitorId]) -> Vec<Vec<Match>> {
        // Odd fields get a phantom entrant; pairing with it means sitting out
        let mut ring: Vec<Option<CompetitorId>> = entrants.iter().copied().map(Some).collect();
        if ring.len() % 2 == 1 {
            ring.push(None);
        }

        let n = ring.len();
        let mut rounds = Vec::with_capacity(n - 1);

        for round in 0..n - 1 {
            let mut matches = Vec::with_capacity(n / 2);
            for i in 0..n / 2 {
                if let (Some(a), Some(b)) = (ring[i], ring[n - 1 - i]) {
                    let id = MatchId::new(category, round as u32 + 1, matches.len() as u32);
                    matches.push(Match::new(
                        id,
                        [Entrant::Competitor(a), Entrant::Competitor(b)],
                        None,
                    ));
                }
            }
            rounds.push(matches);
            ring[1..].rotate_right(1);
        }

        rounds
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
