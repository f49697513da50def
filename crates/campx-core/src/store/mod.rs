//! Durable resource and claim storage.
//!
//! # Contract
//!
//! [`MarketStore`] is technology-agnostic. Implementations must provide:
//!
//! - **Conditional claim insert**: [`MarketStore::insert_claim`] succeeds
//!   only if the resource is `Open` and the claimant holds no live claim on
//!   it; it bumps the resource version in the same transaction so that any
//!   arbitration planned against an older snapshot fails as stale.
//! - **Conditional commit**: [`MarketStore::commit`] applies a whole
//!   [`Changeset`] atomically, and only if every `from` state (and the
//!   resource version) still matches. Otherwise nothing is written and
//!   [`StoreError::Stale`] is returned.
//! - **Deadline index**: [`MarketStore::due_resources`] finds open resources
//!   whose deadline has passed without scanning the whole table.
//!
//! The `SQLite` implementation is [`SqliteMarketStore`].

mod listing;
mod sqlite;
#[cfg(test)]
mod tests;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use thiserror::Error;

pub use listing::{ListCursor, ListFilter, OpenResources, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use sqlite::SqliteMarketStore;

use crate::model::{
    Changeset, Claim, ClaimId, Identity, Resource, ResourceId, ResourceSnapshot,
};

/// Errors raised by store implementations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The shared connection mutex was poisoned by a panicking holder.
    #[error("store connection lock poisoned")]
    LockPoisoned,

    /// Unknown resource.
    #[error("resource not found: {resource_id}")]
    ResourceNotFound {
        /// The resource that was looked up.
        resource_id: String,
    },

    /// Unknown claim.
    #[error("claim not found: {claim_id}")]
    ClaimNotFound {
        /// The claim that was looked up.
        claim_id: String,
    },

    /// A claim was submitted against a resource that is not open.
    #[error("resource {resource_id} is not open")]
    ResourceNotOpen {
        /// The resource.
        resource_id: String,
    },

    /// The claimant already holds a pending or accepted claim.
    #[error("claimant {claimant} already holds a live claim on {resource_id}")]
    DuplicateClaim {
        /// The resource.
        resource_id: String,
        /// The claimant.
        claimant: String,
    },

    /// A conditional write found the row in a different state than planned.
    #[error("stale write: {reason}")]
    Stale {
        /// Which condition failed.
        reason: String,
    },

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}: {reason}")]
    Corrupt {
        /// Table holding the row.
        table: &'static str,
        /// What failed to decode.
        reason: String,
    },

    /// A store call on the blocking pool panicked or was cancelled.
    #[error("blocking store task failed: {0}")]
    Blocking(String),

    /// A payload could not be encoded or decoded.
    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Durable table of resources and claims.
pub trait MarketStore: Send + Sync + fmt::Debug {
    /// Persists a newly created resource.
    fn insert_resource(&self, resource: &Resource) -> Result<(), StoreError>;

    /// Reads a resource.
    fn resource(&self, resource_id: &ResourceId) -> Result<Resource, StoreError>;

    /// Reads a claim.
    fn claim(&self, claim_id: &ClaimId) -> Result<Claim, StoreError>;

    /// Reads a resource together with all of its claims in one consistent
    /// read.
    fn snapshot(&self, resource_id: &ResourceId) -> Result<ResourceSnapshot, StoreError>;

    /// Returns up to `limit` open, not-yet-overdue resources matching
    /// `filter`, newest first, strictly after `after`.
    fn open_page(
        &self,
        filter: &ListFilter,
        after: Option<&ListCursor>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Resource>, StoreError>;

    /// Returns every pending claim on resources advertised by `owner`,
    /// oldest first.
    fn pending_claims_for_owner(&self, owner: &Identity) -> Result<Vec<Claim>, StoreError>;

    /// Inserts a pending claim if the resource is open and the claimant has
    /// no live claim on it.
    fn insert_claim(&self, claim: &Claim) -> Result<(), StoreError>;

    /// Applies `changeset` atomically if the stored state still matches it.
    fn commit(&self, changeset: &Changeset, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Returns up to `limit` open resources whose deadline is at or before
    /// `now`, earliest deadline first.
    fn due_resources(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ResourceId>, StoreError>;

    /// Physically deletes cancelled or expired resources (and their claims)
    /// last changed before `before`. Returns the number of resources
    /// removed.
    fn purge_retired(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Opens a file-backed database with WAL journaling, foreign keys, and a
/// busy timeout so several connections (or processes) can share it.
pub fn open_database(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(table: &'static str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt {
            table,
            reason: format!("timestamp {ms} out of range"),
        })
}
