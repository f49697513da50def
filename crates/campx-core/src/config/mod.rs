//! Marketplace configuration.
//!
//! Parsed from TOML; every section and field has a default so an empty file
//! is a valid configuration. Call [`MarketConfig::validate`] after applying
//! command-line overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::DeadlinePolicy;

/// Shortest allowed sweep interval.
pub const MIN_SWEEP_INTERVAL_SECS: u64 = 1;

/// Longest allowed sweep interval.
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 3600;

/// Longest allowed ticket lifetime (one day).
pub const MAX_TICKET_TTL_SECS: u64 = 86_400;

/// Longest allowed retention window, for posts and for the purge.
pub const MAX_RETENTION_DAYS: u32 = 3650;

/// Top-level marketplace configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketConfig {
    /// Storage settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Arbitration concurrency settings.
    #[serde(default)]
    pub arbitration: ArbitrationConfig,

    /// Expiry sweep settings.
    #[serde(default)]
    pub expiry: ExpiryConfig,

    /// Verification ticket settings.
    #[serde(default)]
    pub tickets: TicketConfig,

    /// Listing deadline policy.
    #[serde(default)]
    pub listings: ListingConfig,
}

impl MarketConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or names unknown keys.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.expiry.interval_secs;
        if !(MIN_SWEEP_INTERVAL_SECS..=MAX_SWEEP_INTERVAL_SECS).contains(&interval) {
            return Err(ConfigError::Validation(format!(
                "expiry.interval_secs must be between {MIN_SWEEP_INTERVAL_SECS} and \
                 {MAX_SWEEP_INTERVAL_SECS}, got {interval}"
            )));
        }
        if self.expiry.batch_limit == 0 {
            return Err(ConfigError::Validation(
                "expiry.batch_limit must be at least 1".to_string(),
            ));
        }
        if let Some(days) = self.expiry.retention_days {
            if !(1..=MAX_RETENTION_DAYS).contains(&days) {
                return Err(ConfigError::Validation(format!(
                    "expiry.retention_days must be between 1 and {MAX_RETENTION_DAYS} when \
                     set, got {days}"
                )));
            }
        }
        if self.arbitration.lock_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "arbitration.lock_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.arbitration.max_commit_attempts == 0 {
            return Err(ConfigError::Validation(
                "arbitration.max_commit_attempts must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_TICKET_TTL_SECS).contains(&self.tickets.ttl_secs) {
            return Err(ConfigError::Validation(format!(
                "tickets.ttl_secs must be between 1 and {MAX_TICKET_TTL_SECS}, got {}",
                self.tickets.ttl_secs
            )));
        }
        if !(4..=10).contains(&self.tickets.secret_len) {
            return Err(ConfigError::Validation(format!(
                "tickets.secret_len must be between 4 and 10, got {}",
                self.tickets.secret_len
            )));
        }
        if self.tickets.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "tickets.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.listings.ride_cutoff_hour > 23 {
            return Err(ConfigError::Validation(format!(
                "listings.ride_cutoff_hour must be 0..=23, got {}",
                self.listings.ride_cutoff_hour
            )));
        }
        let retention = self.listings.lost_found_retention_days;
        if !(1..=MAX_RETENTION_DAYS).contains(&retention) {
            return Err(ConfigError::Validation(format!(
                "listings.lost_found_retention_days must be between 1 and \
                 {MAX_RETENTION_DAYS}, got {retention}"
            )));
        }
        Ok(())
    }

    /// Deadline policy derived from `[listings]`.
    #[must_use]
    pub fn deadline_policy(&self) -> DeadlinePolicy {
        DeadlinePolicy {
            ride_cutoff_hour: self.listings.ride_cutoff_hour,
            lost_found_retention: chrono::Duration::days(i64::from(
                self.listings.lost_found_retention_days,
            )),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Path of the `SQLite` database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long a connection waits on a locked database. Engine store
    /// calls spend this wait on tokio's blocking pool.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Busy timeout as a [`Duration`].
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("campx.sqlite")
}

const fn default_busy_timeout_ms() -> u64 {
    5000
}

/// `[arbitration]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArbitrationConfig {
    /// How long an operation waits for a busy resource before failing with
    /// `Conflict`.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Commit attempts before a stale snapshot is reported as `Conflict`.
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            max_commit_attempts: default_max_commit_attempts(),
        }
    }
}

impl ArbitrationConfig {
    /// Lock timeout as a [`Duration`].
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

const fn default_lock_timeout_ms() -> u64 {
    500
}

const fn default_max_commit_attempts() -> u32 {
    3
}

/// `[expiry]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpiryConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,

    /// Most resources expired per sweep.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Purge withdrawn and expired resources this many days after they
    /// retired. Unset keeps them forever.
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
            batch_limit: default_batch_limit(),
            retention_days: None,
        }
    }
}

impl ExpiryConfig {
    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Retention window, if purging is enabled.
    #[must_use]
    pub fn retention(&self) -> Option<chrono::Duration> {
        self.retention_days
            .map(|days| chrono::Duration::days(i64::from(days)))
    }
}

const fn default_sweep_interval_secs() -> u64 {
    15
}

const fn default_batch_limit() -> usize {
    256
}

/// `[tickets]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketConfig {
    /// Seconds a ticket stays valid.
    #[serde(default = "default_ticket_ttl_secs")]
    pub ttl_secs: u64,

    /// Number of digits in a secret.
    #[serde(default = "default_secret_len")]
    pub secret_len: usize,

    /// Failed verifications before the ticket is destroyed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ticket_ttl_secs(),
            secret_len: default_secret_len(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl TicketConfig {
    /// Ticket lifetime.
    #[must_use]
    pub fn ttl(&self) -> chrono::Duration {
        let secs = i64::try_from(self.ttl_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        chrono::Duration::seconds(secs)
    }
}

const fn default_ticket_ttl_secs() -> u64 {
    300
}

const fn default_secret_len() -> usize {
    6
}

const fn default_max_attempts() -> u32 {
    5
}

/// `[listings]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListingConfig {
    /// Hour (UTC) of the departure day after which a ride is retired.
    #[serde(default = "default_ride_cutoff_hour")]
    pub ride_cutoff_hour: u32,

    /// Days a lost-and-found post stays open.
    #[serde(default = "default_lost_found_retention_days")]
    pub lost_found_retention_days: u32,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            ride_cutoff_hour: default_ride_cutoff_hour(),
            lost_found_retention_days: default_lost_found_retention_days(),
        }
    }
}

const fn default_ride_cutoff_hour() -> u32 {
    20
}

const fn default_lost_found_retention_days() -> u32 {
    7
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
