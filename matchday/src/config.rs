//! Scheduler, log and hub configuration.

use crate::schedule::models::{Venue, duration_secs, option_duration_secs};
use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Schedule engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Venue pool, in preference order
    pub venues: Vec<Venue>,

    /// Earliest start time for any match
    pub day_start: DateTime<Utc>,

    /// Default match length (default: 20 minutes)
    #[serde(with = "duration_secs")]
    pub match_duration: TimeDelta,

    /// Minimum gap between matches sharing a competitor; `None` means one
    /// full match duration
    #[serde(default, with = "option_duration_secs")]
    pub min_gap: Option<TimeDelta>,

    /// Step between candidate start times (default: 5 minutes)
    #[serde(with = "duration_secs")]
    pub slot_granularity: TimeDelta,

    /// How far past its first candidate the placement search looks
    /// (default: 12 hours)
    #[serde(with = "duration_secs")]
    pub lookahead: TimeDelta,

    /// Start the automatic placement search at the current time rather than
    /// `day_start` once the day is under way
    #[serde(default)]
    pub place_from_now: bool,

    /// Whether operators may place a match closer than the minimum gap.
    /// Physical overlap is never allowed.
    pub allow_soft_gap_override: bool,

    /// Place matches as soon as a result makes them eligible
    pub auto_place_on_advance: bool,

    /// Engine command queue size
    pub inbox_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default();
        Self {
            venues: (1..=4).map(|id| Venue::new(id, format!("Mat {id}"))).collect(),
            day_start: Utc::now().date_naive().and_time(nine).and_utc(),
            match_duration: TimeDelta::minutes(20),
            min_gap: None,
            slot_granularity: TimeDelta::minutes(5),
            lookahead: TimeDelta::hours(12),
            place_from_now: false,
            allow_soft_gap_override: true,
            auto_place_on_advance: true,
            inbox_capacity: 100,
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.venues.is_empty() {
            return Err("At least one venue is required".to_string());
        }

        let mut ids: Vec<_> = self.venues.iter().map(|v| v.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.venues.len() {
            return Err("Venue ids must be unique".to_string());
        }

        if self.match_duration <= TimeDelta::zero() {
            return Err("Match duration must be positive".to_string());
        }

        if self.min_gap.is_some_and(|gap| gap < TimeDelta::zero()) {
            return Err("Minimum gap cannot be negative".to_string());
        }

        if self.slot_granularity <= TimeDelta::zero() {
            return Err("Slot granularity must be positive".to_string());
        }

        if self.lookahead < self.match_duration {
            return Err("Lookahead must cover at least one match".to_string());
        }

        if self.day_start.checked_add_signed(self.lookahead).is_none() {
            return Err("Day start plus lookahead is out of range".to_string());
        }

        if self.inbox_capacity == 0 {
            return Err("Inbox capacity must be at least 1".to_string());
        }

        Ok(())
    }

    /// Default minimum gap
    pub fn effective_min_gap(&self) -> TimeDelta {
        self.min_gap.unwrap_or(self.match_duration)
    }
}

/// Mutation log configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Records kept in memory for backfill. `None` keeps all of them; older
    /// records stay in the durable store but a client behind the window must
    /// resync from a snapshot.
    pub hot_window: Option<usize>,

    /// Capacity of the live broadcast channel (default: 1024)
    pub broadcast_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            hot_window: None,
            broadcast_capacity: 1024,
        }
    }
}

/// Realtime hub configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Undelivered records per client before it is disconnected (default: 256)
    pub client_backlog: usize,

    /// Silence after which a live client is considered gone (default: 30s)
    pub heartbeat_timeout: Duration,

    /// How long a dropped client's state is kept for reconnection (default: 120s)
    pub reconnect_grace: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_backlog: 256,
            heartbeat_timeout: Duration::from_secs(30),
            reconnect_grace: Duration::from_secs(120),
        }
    }
}

impl HubConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.client_backlog == 0 {
            return Err("Client backlog must be at least 1".to_string());
        }
        if self.heartbeat_timeout.is_zero() {
            return Err("Heartbeat timeout must be positive".to_string());
        }
        Ok(())
    }
}
