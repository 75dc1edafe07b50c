//! Double-elimination layout.
//!
//! The winners bracket is the single-elimination layout. Every winners
//! match sends its loser into the losers bracket, which alternates two kinds
//! of round: a reduction round pairing losers-bracket survivors among
//! themselves, then a drop-in round pairing the survivors with the losers of
//! the next winners round. The winners champion meets the losers champion in
//! a single grand final; there is no reset match.
//!
//! Losers-bracket rounds are numbered after the winners rounds and the grand
//! final takes the last round number, so match ids stay unique per category.

use super::{BracketFormat, Elimination};
use crate::schedule::models::{Advance, CategoryId, CompetitorId, Entrant, Match, MatchId};
use serde::{Deserialize, Serialize};

/// Double-elimination bracket; a competitor is out after a second loss
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleElimination {}

/// A side of a losers-bracket match, by (round index, position) of its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    WinnerOf(usize, usize),
    LoserOf(usize, usize),
}

fn link(rounds: &mut [Vec<Match>], feed: Feed, match_id: MatchId, side: usize) {
    let advance = Some(Advance { match_id, side });
    match feed {
        Feed::WinnerOf(round, position) => rounds[round][position].next = advance,
        Feed::LoserOf(round, position) => rounds[round][position].loser_next = advance,
    }
}

/// Append a round playing `pairs` and return the feeds of its winners
fn push_round(rounds: &mut Vec<Vec<Match>>, category: CategoryId, pairs: &[(Feed, Feed)]) -> Vec<Feed> {
    let index = rounds.len();
    let round = index as u32 + 1;

    let mut matches = Vec::with_capacity(pairs.len());
    for (position, (a, b)) in pairs.iter().enumerate() {
        let id = MatchId::new(category, round, position as u32);
        link(rounds, *a, id, 0);
        link(rounds, *b, id, 1);
        matches.push(Match::new(id, [Entrant::Awaiting, Entrant::Awaiting], None));
    }
    rounds.push(matches);

    (0..pairs.len()).map(|p| Feed::WinnerOf(index, p)).collect()
}

/// Halve the survivors. With an odd count the first survivor sits the round out.
fn reduce(rounds: &mut Vec<Vec<Match>>, category: CategoryId, survivors: &[Feed]) -> Vec<Feed> {
    let (carried, rest) = match survivors.split_first() {
        Some((first, rest)) if survivors.len() % 2 == 1 => (Some(*first), rest),
        _ => (None, survivors),
    };
    let n = rest.len();
    let pairs: Vec<(Feed, Feed)> = (0..n / 2).map(|i| (rest[i], rest[n - 1 - i])).collect();

    let winners = push_round(rounds, category, &pairs);
    carried.into_iter().chain(winners).collect()
}

fn losers_of(rounds: &[Vec<Match>], round: usize) -> Vec<Feed> {
    (0..rounds[round].len())
        .map(|position| Feed::LoserOf(round, position))
        .collect()
}

impl BracketFormat for DoubleElimination {
    fn layout_rounds(&self, category: CategoryId, entrants: &[CompetitorId]) -> Vec<Vec<Match>> {
        let mut rounds = Elimination {}.layout_rounds(category, entrants);
        let winners_rounds = rounds.len();
        if winners_rounds == 0 {
            return rounds;
        }

        let mut survivors = losers_of(&rounds, 0);
        for round in 1..winners_rounds {
            let mut incoming = losers_of(&rounds, round);
            while survivors.len() > incoming.len() {
                survivors = reduce(&mut rounds, category, &survivors);
            }
            // Reversed so a drop-in rarely meets the competitor it just lost to
            incoming.reverse();
            let pairs: Vec<(Feed, Feed)> = survivors.iter().copied().zip(incoming).collect();
            survivors = push_round(&mut rounds, category, &pairs);
        }
        while survivors.len() > 1 {
            survivors = reduce(&mut rounds, category, &survivors);
        }

        let Some(&contender) = survivors.first() else {
            return rounds;
        };
        let champion = Feed::WinnerOf(winners_rounds - 1, 0);
        push_round(&mut rounds, category, &[(champion, contender)]);

        rounds
    }

    fn name(&self) -> &'static str {
        "double_elimination"
    }
}
