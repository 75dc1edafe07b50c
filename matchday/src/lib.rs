//! # Matchday
//!
//! Clash-free match scheduling for multi-category tournaments.
//!
//! A competitor registered in several categories (e.g. an athlete entered
//! in both kata and kumite) must never be placed in two matches that overlap
//! or follow each other closer than a minimum gap. This crate builds
//! brackets from read-only registration data, places matches onto a finite
//! venue pool without such clashes, and records every schedule change in an
//! append-only mutation log that live clients follow through the realtime
//! hub.
//!
//! ## Architecture
//!
//! - **Engine**: a single tokio actor owns the log writer, so all schedule
//!   mutations are serialized through one inbox
//! - **Mutation log**: the schedule is a fold over versioned records;
//!   snapshots, replays and live tails are all views of it
//! - **Hub**: per-client bounded queues fed from the log's live broadcast,
//!   with gap-free backfill on reconnect
//!
//! ## Core Modules
//!
//! - [`registry`]: competitor and category lookup
//! - [`bracket`]: single/double elimination and round-robin layouts
//! - [`clash`]: the minimum-gap check
//! - [`schedule`]: data models, the folded state and the engine actor
//! - [`mutation`]: the mutation log and its stores
//! - [`hub`]: realtime subscriptions
//! - [`db`]: PostgreSQL pool and durable log store
//!
//! ## Example
//!
//! ```
//! use matchday::{LogConfig, MemoryLogStore, MutationLog};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), matchday::LogError> {
//!     let (log, _writer) =
//!         MutationLog::open(Arc::new(MemoryLogStore::new()), LogConfig::default()).await?;
//!     assert_eq!(log.head_seq().await, 0);
//!     Ok(())
//! }
//! ```

/// Bracket construction.
pub mod bracket;

/// Minimum-gap clash detection.
pub mod clash;

/// Scheduler, log and hub configuration.
pub mod config;

/// PostgreSQL persistence.
pub mod db;

/// Realtime subscriptions.
pub mod hub;

/// Append-only mutation log.
pub mod mutation;

/// Registration data access.
pub mod registry;

/// Scheduling models, state and engine.
pub mod schedule;

pub use bracket::{
    Bracket, BracketError, BracketFormat, BracketType, DoubleElimination, Elimination, RoundRobin,
};
pub use clash::{ClashCheck, ClashViolation, GapPolicy, check_placement};
pub use config::{HubConfig, LogConfig, SchedulerConfig};
pub use hub::{
    ConnectionState, HubError, RealtimeHub, Subscription, SyncStart, TopicFilter,
};
pub use mutation::{
    ChangeCause, LogError, LogStore, LogWriter, MemoryLogStore, MutationLog, MutationRecord,
};
pub use registry::{Category, Competitor, InMemoryRegistry, Registry, RegistryData, RegistryError};
pub use schedule::{
    Entrant, Match, MatchId, MatchState, PlacementOutcome, ScheduleEngine, ScheduleError,
    ScheduleHandle, ScheduleResult, ScheduleState, Slot, Venue,
};
