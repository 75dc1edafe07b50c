//! Match scheduling: data models, the folded schedule state and the engine
//! actor that serializes every schedule mutation.

pub mod engine;
pub mod errors;
pub mod messages;
pub mod models;
pub mod state;

pub use engine::{ScheduleEngine, ScheduleHandle};
pub use errors::{ScheduleError, ScheduleResult};
pub use messages::{
    BracketReport, DeferReason, DeferredMatch, ManualPlacement, PlacedMatch, PlacementOutcome,
    ResultReport, ScheduleReport, WithdrawReport,
};
pub use models::{
    Advance, CategoryId, CompetitorId, Entrant, Match, MatchId, MatchState, Outcome, Slot, Venue,
    VenueId,
};
pub use state::ScheduleState;
