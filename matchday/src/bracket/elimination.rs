//! Single-elimination layout.
//!
//! Each round lists its entrants in rank order (a winner slot ranks as the
//! best seed that could fill it). When a round has an odd number of
//! entrants, the top-ranked one receives a bye; the rest are paired top
//! against bottom. The number of entrants halves (rounding up) every round,
//! so a field of N needs `ceil(log2(N))` rounds, and for a power-of-two
//! field this reproduces the standard 1v8, 4v5, 2v7, 3v6 bracket.

use super::BracketFormat;
use crate::schedule::models::{Advance, CategoryId, CompetitorId, Entrant, Match, MatchId};
use serde::{Deserialize, Serialize};

/// Single-elimination bracket; winners advance, losers are out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Elimination {}

/// Where an entrant of a round comes from
#[derive(Debug, Clone, Copy)]
enum Source {
    Seed(CompetitorId),
    /// Winner of the match at this position in the previous round
    WinnerOf(usize),
}

impl Source {
    fn entrant(self) -> Entrant {
        match self {
            Source::Seed(id) => Entrant::Competitor(id),
            Source::WinnerOf(_) => Entrant::Awaiting,
        }
    }
}

impl BracketFormat for Elimination {
    fn layout_rounds(&self, category: CategoryId, entrants: &[CompetitorId]) -> Vec<Vec<Match>> {
        let mut rounds: Vec<Vec<Match>> = Vec::new();
        let mut sources: Vec<Source> = entrants.iter().map(|id| Source::Seed(*id)).collect();
        let mut round = 1u32;

        while sources.len() > 1 {
            let mut matches = Vec::with_capacity(sources.len().div_ceil(2));
            let mut pairings: Vec<[Option<Source>; 2]> = Vec::with_capacity(matches.capacity());

            let rest = if sources.len() % 2 == 1 {
                pairings.push([Some(sources[0]), None]);
                &sources[1..]
            } else {
                &sources[..]
            };

            let n = rest.len();
            for i in 0..n / 2 {
                pairings.push([Some(rest[i]), Some(rest[n - 1 - i])]);
            }

            for (position, pairing) in pairings.iter().enumerate() {
                let id = MatchId::new(category, round, position as u32);
                let entrants = pairing.map(|side| side.map_or(Entrant::Bye, Source::entrant));

                // Link feeder matches of the previous round to this one
                if let Some(previous) = rounds.last_mut() {
                    for (side, source) in pairing.iter().enumerate() {
                        if let Some(Source::WinnerOf(feeder)) = source {
                            previous[*feeder].next = Some(Advance { match_id: id, side });
                        }
                    }
                }

                matches.push(Match::new(id, entrants, None));
            }

            sources = (0..matches.len()).map(Source::WinnerOf).collect();
            rounds.push(matches);
            round += 1;
        }

        rounds
    }

    fn name(&self) -> &'static str {
        "elimination"
    }
}
