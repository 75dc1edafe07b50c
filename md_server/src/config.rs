//! Server configuration management.
//!
//! Consolidates all environment variable reads and provides validated configuration.

use chrono::{DateTime, TimeDelta, Utc};
use matchday::{
    HubConfig, LogConfig, SchedulerConfig, Venue, db::DatabaseConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Complete server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP/WebSocket bind address
    pub bind: SocketAddr,
    /// Prometheus scrape listener, if enabled
    pub metrics_bind: Option<SocketAddr>,
    /// Where the mutation log is persisted
    pub storage: StorageConfig,
    /// Registry export to load competitors and categories from
    pub registry_path: PathBuf,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
    pub hub: HubConfig,
    /// How often the hub checks heartbeats and reconnect grace periods
    pub sweep_interval: Duration,
}

/// Mutation log storage
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Process-local; lost on restart
    Memory,
    Postgres(DatabaseConfig),
}

/// Values given on the command line take precedence over the environment
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<SocketAddr>,
    pub database_url: Option<String>,
    pub registry: Option<PathBuf>,
    pub memory: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns error if required variables are missing or invalid
    pub fn from_env(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let bind = match overrides.bind {
            Some(bind) => bind,
            None => parse_env_or("SERVER_BIND", SocketAddr::from(([127, 0, 0, 1], 8080)))?,
        };
        let metrics_bind = parse_env_opt("METRICS_BIND")?;

        let storage = if overrides.memory || parse_env_or("MEMORY_STORE", false)? {
            StorageConfig::Memory
        } else {
            let database_url = overrides
                .database_url
                .or_else(|| std::env::var("DATABASE_URL").ok())
                .ok_or_else(|| ConfigError::MissingRequired {
                    var: "DATABASE_URL".to_string(),
                    hint: "Pass --db-url, or --memory to run without persistence".to_string(),
                })?;
            let database = DatabaseConfig::with_url(database_url).map_err(|reason| {
                ConfigError::Invalid {
                    var: "DB_*".to_string(),
                    reason,
                }
            })?;
            StorageConfig::Postgres(database)
        };

        let registry_path = overrides
            .registry
            .or_else(|| std::env::var("REGISTRY_PATH").ok().map(PathBuf::from))
            .ok_or_else(|| ConfigError::MissingRequired {
                var: "REGISTRY_PATH".to_string(),
                hint: "Point it at the registration system's JSON export".to_string(),
            })?;

        let scheduler = scheduler_from_env()?;

        let log = LogConfig {
            hot_window: parse_env_opt("LOG_HOT_WINDOW")?,
            broadcast_capacity: parse_env_or("LOG_BROADCAST_CAPACITY", 1024)?,
        };

        let hub_defaults = HubConfig::default();
        let hub = HubConfig {
            client_backlog: parse_env_or("HUB_CLIENT_BACKLOG", hub_defaults.client_backlog)?,
            heartbeat_timeout: Duration::from_secs(parse_env_or(
                "HUB_HEARTBEAT_TIMEOUT_SECS",
                hub_defaults.heartbeat_timeout.as_secs(),
            )?),
            reconnect_grace: Duration::from_secs(parse_env_or(
                "HUB_RECONNECT_GRACE_SECS",
                hub_defaults.reconnect_grace.as_secs(),
            )?),
        };

        let sweep_interval = Duration::from_secs(parse_env_or("HUB_SWEEP_INTERVAL_SECS", 5)?);

        Ok(ServerConfig {
            bind,
            metrics_bind,
            storage,
            registry_path,
            scheduler,
            log,
            hub,
            sweep_interval,
        })
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler
            .validate()
            .map_err(|reason| ConfigError::Invalid {
                var: "scheduler".to_string(),
                reason,
            })?;

        self.hub.validate().map_err(|reason| ConfigError::Invalid {
            var: "hub".to_string(),
            reason,
        })?;

        if self.log.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid {
                var: "LOG_BROADCAST_CAPACITY".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.log.hot_window == Some(0) {
            return Err(ConfigError::Invalid {
                var: "LOG_HOT_WINDOW".to_string(),
                reason: "Must be greater than 0 when set".to_string(),
            });
        }

        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "HUB_SWEEP_INTERVAL_SECS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Scheduler settings; `VENUES` is a comma-separated list of names, or
/// `VENUE_COUNT` numbered mats
fn scheduler_from_env() -> Result<SchedulerConfig, ConfigError> {
    let defaults = SchedulerConfig::default();

    let venues = match std::env::var("VENUES") {
        Ok(names) => names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .zip(1..)
            .map(|(name, id)| Venue::new(id, name))
            .collect(),
        Err(_) => {
            let count: u32 = parse_env_or("VENUE_COUNT", defaults.venues.len() as u32)?;
            (1..=count).map(|id| Venue::new(id, format!("Mat {id}"))).collect()
        }
    };

    let day_start = match std::env::var("DAY_START") {
        Ok(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ConfigError::Invalid {
                var: "DAY_START".to_string(),
                reason: format!("Expected RFC 3339 timestamp: {e}"),
            })?,
        Err(_) => defaults.day_start,
    };

    Ok(SchedulerConfig {
        venues,
        day_start,
        match_duration: secs_env_or("MATCH_DURATION_SECS", defaults.match_duration)?,
        min_gap: parse_env_opt::<i64>("MIN_GAP_SECS")?
            .map(|secs| to_delta("MIN_GAP_SECS", secs))
            .transpose()?,
        slot_granularity: secs_env_or("SLOT_GRANULARITY_SECS", defaults.slot_granularity)?,
        lookahead: secs_env_or("LOOKAHEAD_SECS", defaults.lookahead)?,
        // A live server places into the remaining day, not its past
        place_from_now: parse_env_or("PLACE_FROM_NOW", true)?,
        allow_soft_gap_override: parse_env_or(
            "ALLOW_GAP_OVERRIDE",
            defaults.allow_soft_gap_override,
        )?,
        auto_place_on_advance: parse_env_or("AUTO_PLACE", defaults.auto_place_on_advance)?,
        inbox_capacity: parse_env_or("ENGINE_INBOX_CAPACITY", defaults.inbox_capacity)?,
    })
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {var}\nHint: {hint}")]
    MissingRequired { var: String, hint: String },

    #[error("Invalid configuration for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Helper to parse an optional environment variable
fn parse_env_opt<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            var: key.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

/// Helper to parse environment variable with default fallback
fn parse_env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_env_opt(key)?.unwrap_or(default))
}

fn to_delta(key: &str, secs: i64) -> Result<TimeDelta, ConfigError> {
    TimeDelta::try_seconds(secs).ok_or_else(|| ConfigError::Invalid {
        var: key.to_string(),
        reason: format!("{secs} seconds is out of range"),
    })
}

fn secs_env_or(key: &str, default: TimeDelta) -> Result<TimeDelta, ConfigError> {
    match parse_env_opt::<i64>(key)? {
        Some(secs) => to_delta(key, secs),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:8080".parse().unwrap(),
            metrics_bind: None,
            storage: StorageConfig::Memory,
            registry_path: PathBuf::from("registry.json"),
            scheduler: SchedulerConfig::default(),
            log: LogConfig::default(),
            hub: HubConfig::default(),
            sweep_interval: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingRequired {
            var: "REGISTRY_PATH".to_string(),
            hint: "Point it at the export".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("REGISTRY_PATH"));
        assert!(msg.contains("Point it at the export"));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_config_validation_no_venues() {
        let mut config = config();
        config.scheduler.venues.clear();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_config_validation_zero_backlog() {
        let mut config = config();
        config.hub.client_backlog = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_config_validation_zero_hot_window() {
        let mut config = config();
        config.log.hot_window = Some(0);
        assert!(config.validate().is_err());
    }
}
