//! Durable verification ticket storage.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::TicketPurpose;
use crate::store::{from_millis, to_millis, StoreError};

const TICKETS: &str = "verification_tickets";

/// One stored ticket. Holds the secret digest, never the secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketRecord {
    /// Unique id; also salts the digest.
    pub ticket_id: String,
    /// Normalized key (e-mail address or account id).
    pub key: String,
    /// What the ticket verifies.
    pub purpose: TicketPurpose,
    /// SHA-256 over `ticket_id || 0x00 || secret`.
    pub secret_digest: Vec<u8>,
    /// Opaque payload released on successful verification.
    pub payload: serde_json::Value,
    /// Mismatched verification attempts so far.
    pub failed_attempts: u32,
    /// Issue time.
    pub created_at: DateTime<Utc>,
    /// Instant after which the ticket no longer verifies.
    pub expires_at: DateTime<Utc>,
}

/// Result of recording a failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The ticket survives with this many attempts left.
    Remaining(u32),
    /// The limit was reached and the ticket was destroyed.
    Exhausted,
    /// The ticket was already gone.
    Gone,
}

/// Storage for verification tickets.
pub trait TicketStore: Send + Sync + std::fmt::Debug {
    /// Stores `record`, deleting any ticket for the same key and purpose in
    /// the same transaction.
    fn replace(&self, record: &TicketRecord) -> Result<(), StoreError>;

    /// Looks up the live ticket for `(key, purpose)`.
    fn find(&self, key: &str, purpose: TicketPurpose) -> Result<Option<TicketRecord>, StoreError>;

    /// Deletes the ticket. Returns `true` only for the caller whose delete
    /// removed it.
    fn consume(&self, ticket_id: &str) -> Result<bool, StoreError>;

    /// Counts one failed attempt, destroying the ticket at `max_attempts`.
    fn record_failure(&self, ticket_id: &str, max_attempts: u32) -> Result<AttemptOutcome, StoreError>;

    /// Deletes every ticket whose expiry is at or before `now`.
    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// `SQLite`-backed [`TicketStore`].
#[derive(Debug, Clone)]
pub struct SqliteTicketStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTicketStore {
    /// Wraps `conn`, creating the schema if needed.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self, StoreError> {
        {
            let guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            Self::init_schema(&guard)?;
        }
        Ok(Self { conn })
    }

    /// Creates the ticket table. Idempotent.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS verification_tickets (
                ticket_id TEXT PRIMARY KEY,
                ticket_key TEXT NOT NULL,
                purpose TEXT NOT NULL
                    CHECK(purpose IN ('signup', 'password_reset', 'account_deletion')),
                secret_digest BLOB NOT NULL,
                payload_json TEXT NOT NULL,
                failed_attempts INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL,
                UNIQUE(ticket_key, purpose)
            );
            CREATE INDEX IF NOT EXISTS idx_verification_tickets_expiry
                ON verification_tickets(expires_at_ms);",
        )
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl TicketStore for SqliteTicketStore {
    fn replace(&self, record: &TicketRecord) -> Result<(), StoreError> {
        let payload_json = serde_json::to_string(&record.payload)?;
        let guard = self.lock()?;
        let tx = Transaction::new_unchecked(&guard, TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM verification_tickets WHERE ticket_key = ?1 AND purpose = ?2",
            params![record.key, record.purpose.as_str()],
        )?;
        tx.execute(
            "INSERT INTO verification_tickets
             (ticket_id, ticket_key, purpose, secret_digest, payload_json, failed_attempts,
              created_at_ms, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.ticket_id,
                record.key,
                record.purpose.as_str(),
                record.secret_digest,
                payload_json,
                record.failed_attempts,
                to_millis(record.created_at),
                to_millis(record.expires_at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn find(&self, key: &str, purpose: TicketPurpose) -> Result<Option<TicketRecord>, StoreError> {
        let guard = self.lock()?;
        let row = guard
            .query_row(
                "SELECT ticket_id, ticket_key, purpose, secret_digest, payload_json,
                        failed_attempts, created_at_ms, expires_at_ms
                 FROM verification_tickets
                 WHERE ticket_key = ?1 AND purpose = ?2",
                params![key, purpose.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((ticket_id, key, purpose, secret_digest, payload_json, failed, created, expires)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(TicketRecord {
            ticket_id,
            key,
            purpose: purpose.parse().map_err(|reason| StoreError::Corrupt {
                table: TICKETS,
                reason,
            })?,
            secret_digest,
            payload: serde_json::from_str(&payload_json)?,
            failed_attempts: failed,
            created_at: from_millis(TICKETS, created)?,
            expires_at: from_millis(TICKETS, expires)?,
        }))
    }

    fn consume(&self, ticket_id: &str) -> Result<bool, StoreError> {
        let guard = self.lock()?;
        let deleted = guard.execute(
            "DELETE FROM verification_tickets WHERE ticket_id = ?1",
            params![ticket_id],
        )?;
        Ok(deleted == 1)
    }

    fn record_failure(&self, ticket_id: &str, max_attempts: u32) -> Result<AttemptOutcome, StoreError> {
        let guard = self.lock()?;
        let tx = Transaction::new_unchecked(&guard, TransactionBehavior::Immediate)?;
        let failed: Option<u32> = tx
            .query_row(
                "UPDATE verification_tickets
                 SET failed_attempts = failed_attempts + 1
                 WHERE ticket_id = ?1
                 RETURNING failed_attempts",
                params![ticket_id],
                |row| row.get(0),
            )
            .optional()?;
        let outcome = match failed {
            None => AttemptOutcome::Gone,
            Some(failed) if failed >= max_attempts => {
                tx.execute(
                    "DELETE FROM verification_tickets WHERE ticket_id = ?1",
                    params![ticket_id],
                )?;
                AttemptOutcome::Exhausted
            },
            Some(failed) => AttemptOutcome::Remaining(max_attempts - failed),
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let guard = self.lock()?;
        let deleted = guard.execute(
            "DELETE FROM verification_tickets WHERE expires_at_ms <= ?1",
            params![to_millis(now)],
        )?;
        Ok(deleted)
    }
}
