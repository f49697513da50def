//! One-time verification tickets (signup, password reset, account deletion).
//!
//! A ticket is a degenerate single-claim resource: issuing one for a key
//! supersedes the previous ticket for that key and purpose, and the first
//! verification with the right secret consumes it. Only a salted SHA-256
//! digest of the secret is stored; the plaintext is handed to the caller
//! once, inside a [`SecretString`], for out-of-band delivery.

mod store;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

pub use store::{AttemptOutcome, SqliteTicketStore, TicketRecord, TicketStore};

use crate::clock::Clock;
use crate::config::TicketConfig;
use crate::error::MarketError;

/// What a ticket verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPurpose {
    /// Confirming a new account's address.
    Signup,
    /// Authorizing a password change.
    PasswordReset,
    /// Confirming account deletion.
    AccountDeletion,
}

impl TicketPurpose {
    /// Returns the storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Signup => "signup",
            Self::PasswordReset => "password_reset",
            Self::AccountDeletion => "account_deletion",
        }
    }
}

impl fmt::Display for TicketPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signup" => Ok(Self::Signup),
            "password_reset" => Ok(Self::PasswordReset),
            "account_deletion" => Ok(Self::AccountDeletion),
            other => Err(format!("unknown ticket purpose '{other}'")),
        }
    }
}

/// A freshly issued ticket. The only place the plaintext secret exists.
#[derive(Debug)]
pub struct IssuedTicket {
    /// Ticket id.
    pub ticket_id: String,
    /// Normalized key the ticket was issued for.
    pub key: String,
    /// What it verifies.
    pub purpose: TicketPurpose,
    /// Numeric secret to deliver out of band.
    pub secret: SecretString,
    /// Instant after which it no longer verifies.
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies tickets.
#[derive(Debug)]
pub struct TicketService {
    store: Arc<dyn TicketStore>,
    clock: Arc<dyn Clock>,
    config: TicketConfig,
}

impl TicketService {
    /// Creates the service.
    #[must_use]
    pub fn new(store: Arc<dyn TicketStore>, clock: Arc<dyn Clock>, config: TicketConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Issues a ticket for `(key, purpose)`, replacing any earlier one.
    ///
    /// `payload` is returned verbatim by the successful [`Self::verify`].
    pub fn issue(
        &self,
        key: &str,
        purpose: TicketPurpose,
        payload: serde_json::Value,
    ) -> Result<IssuedTicket, MarketError> {
        let key = normalize_key(key)?;
        let now = self.clock.now();
        let ticket_id = format!("TKT-{}", uuid::Uuid::new_v4());
        let secret = generate_secret(self.config.secret_len);
        let expires_at = now.checked_add_signed(self.config.ttl()).ok_or_else(|| {
            MarketError::validation("ttl_secs", "ticket expiry is out of range")
        })?;

        self.store.replace(&TicketRecord {
            ticket_id: ticket_id.clone(),
            key: key.clone(),
            purpose,
            secret_digest: secret_digest(&ticket_id, &secret),
            payload,
            failed_attempts: 0,
            created_at: now,
            expires_at,
        })?;
        info!(ticket_id = %ticket_id, purpose = %purpose, expires_at = %expires_at, "ticket issued");

        Ok(IssuedTicket {
            ticket_id,
            key,
            purpose,
            secret: SecretString::from(secret),
            expires_at,
        })
    }

    /// Verifies `supplied` against the live ticket for `(key, purpose)` and
    /// consumes it on success, returning its payload.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no ticket, already consumed, or destroyed after too
    ///   many failed attempts
    /// - `Expired`: past its expiry
    /// - `InvalidSecret`: wrong secret (counts toward the attempt limit)
    pub fn verify(
        &self,
        key: &str,
        purpose: TicketPurpose,
        supplied: &str,
    ) -> Result<serde_json::Value, MarketError> {
        let key = normalize_key(key)?;
        let not_found = || MarketError::NotFound {
            entity: "ticket",
            id: format!("{purpose}:{key}"),
        };
        let record = self.store.find(&key, purpose)?.ok_or_else(not_found)?;

        if self.clock.now() >= record.expires_at {
            return Err(MarketError::Expired {
                entity: "ticket",
                id: record.ticket_id,
            });
        }

        let supplied_digest = secret_digest(&record.ticket_id, supplied.trim());
        if !bool::from(supplied_digest.as_slice().ct_eq(record.secret_digest.as_slice())) {
            match self
                .store
                .record_failure(&record.ticket_id, self.config.max_attempts)?
            {
                AttemptOutcome::Exhausted => warn!(
                    ticket_id = %record.ticket_id,
                    purpose = %purpose,
                    "ticket destroyed after too many failed attempts"
                ),
                AttemptOutcome::Remaining(left) => {
                    debug!(ticket_id = %record.ticket_id, left, "ticket secret mismatch");
                },
                AttemptOutcome::Gone => {},
            }
            return Err(MarketError::InvalidSecret);
        }

        if !self.store.consume(&record.ticket_id)? {
            return Err(not_found());
        }
        info!(ticket_id = %record.ticket_id, purpose = %purpose, "ticket consumed");
        Ok(record.payload)
    }

    /// Deletes every expired ticket.
    pub fn purge_expired(&self) -> Result<usize, MarketError> {
        Ok(self.store.delete_expired(self.clock.now())?)
    }
}

/// Trims and lowercases a ticket key.
fn normalize_key(key: &str) -> Result<String, MarketError> {
    let key = key.trim().to_lowercase();
    if key.is_empty() {
        return Err(MarketError::validation("key", "must not be empty"));
    }
    Ok(key)
}

fn generate_secret(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

fn secret_digest(ticket_id: &str, secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(ticket_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}
