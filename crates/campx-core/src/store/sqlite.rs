//! `SQLite`-backed [`MarketStore`].
//!
//! All writes run in `IMMEDIATE` transactions so that the write lock is
//! taken before any condition is evaluated; together with the version
//! column this keeps arbitration linearizable per resource even when
//! several processes share one database file.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::listing::{ListCursor, ListFilter};
use super::{from_millis, to_millis, MarketStore, StoreError};
use crate::model::{
    Changeset, Claim, ClaimId, ClaimPayload, Identity, Resource, ResourceId, ResourcePayload,
    ResourceSnapshot,
};

const RESOURCES: &str = "market_resources";
const CLAIMS: &str = "market_claims";

const RESOURCE_COLUMNS: &str = "resource_id, owner, kind, state, version, deadline_ms, \
                                payload_json, created_at_ms, updated_at_ms";
const CLAIM_COLUMNS: &str =
    "claim_id, resource_id, claimant, state, payload_json, created_at_ms, updated_at_ms";

/// Resource and claim tables in a shared `SQLite` connection.
#[derive(Debug, Clone)]
pub struct SqliteMarketStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMarketStore {
    /// Wraps `conn`, creating the schema if needed.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self, StoreError> {
        {
            let guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            Self::init_schema(&guard)?;
        }
        Ok(Self { conn })
    }

    /// Creates the market tables and indexes. Idempotent.
    ///
    /// `idx_market_claims_live` enforces at most one pending-or-accepted
    /// claim per `(resource, claimant)`; `idx_market_claims_winner` enforces
    /// at most one accepted claim per resource; `idx_market_resources_due`
    /// is the deadline index the expiry sweep scans.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS market_resources (
                resource_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                kind TEXT NOT NULL CHECK(kind IN ('ride', 'lost_found')),
                state TEXT NOT NULL
                    CHECK(state IN ('open', 'committed', 'cancelled', 'expired')),
                version INTEGER NOT NULL DEFAULT 0,
                deadline_ms INTEGER,
                payload_json TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_market_resources_due
                ON market_resources(state, deadline_ms)
                WHERE deadline_ms IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_market_resources_listing
                ON market_resources(state, created_at_ms, resource_id);

            CREATE TABLE IF NOT EXISTS market_claims (
                claim_id TEXT PRIMARY KEY,
                resource_id TEXT NOT NULL REFERENCES market_resources(resource_id),
                claimant TEXT NOT NULL,
                state TEXT NOT NULL
                    CHECK(state IN ('pending', 'accepted', 'rejected', 'cancelled')),
                payload_json TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_market_claims_live
                ON market_claims(resource_id, claimant)
                WHERE state IN ('pending', 'accepted');
            CREATE UNIQUE INDEX IF NOT EXISTS idx_market_claims_winner
                ON market_claims(resource_id)
                WHERE state = 'accepted';
            CREATE INDEX IF NOT EXISTS idx_market_claims_resource
                ON market_claims(resource_id, created_at_ms);",
        )
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl MarketStore for SqliteMarketStore {
    fn insert_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let payload_json = serde_json::to_string(&resource.payload)?;
        let guard = self.lock()?;
        guard.execute(
            "INSERT INTO market_resources
             (resource_id, owner, kind, state, version, deadline_ms, payload_json,
              created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                resource.id.as_str(),
                resource.owner.as_str(),
                resource.kind().as_str(),
                resource.state.as_str(),
                version_to_sql(resource.version)?,
                resource.deadline.map(to_millis),
                payload_json,
                to_millis(resource.created_at),
                to_millis(resource.updated_at),
            ],
        )?;
        Ok(())
    }

    fn resource(&self, resource_id: &ResourceId) -> Result<Resource, StoreError> {
        let guard = self.lock()?;
        read_resource(&guard, resource_id)
    }

    fn claim(&self, claim_id: &ClaimId) -> Result<Claim, StoreError> {
        let guard = self.lock()?;
        let row = guard
            .query_row(
                &format!("SELECT {CLAIM_COLUMNS} FROM market_claims WHERE claim_id = ?1"),
                params![claim_id.as_str()],
                ClaimRow::read,
            )
            .optional()?
            .ok_or_else(|| StoreError::ClaimNotFound {
                claim_id: claim_id.to_string(),
            })?;
        row.decode()
    }

    fn snapshot(&self, resource_id: &ResourceId) -> Result<ResourceSnapshot, StoreError> {
        let guard = self.lock()?;
        let tx = guard.unchecked_transaction()?;
        let resource = read_resource(&tx, resource_id)?;
        let claims = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {CLAIM_COLUMNS} FROM market_claims
                 WHERE resource_id = ?1
                 ORDER BY created_at_ms ASC, claim_id ASC"
            ))?;
            let rows = stmt
                .query_map(params![resource_id.as_str()], ClaimRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(ClaimRow::decode)
                .collect::<Result<Vec<_>, _>>()?
        };
        tx.finish()?;
        Ok(ResourceSnapshot { resource, claims })
    }

    fn open_page(
        &self,
        filter: &ListFilter,
        after: Option<&ListCursor>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Resource>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut sql = format!(
            "SELECT {RESOURCE_COLUMNS} FROM market_resources
             WHERE state = 'open' AND (deadline_ms IS NULL OR deadline_ms > ?1)"
        );
        let mut args = vec![Value::Integer(to_millis(now))];

        if let Some(kind) = filter.kind {
            args.push(Value::Text(kind.as_str().to_string()));
            let _ = write!(sql, " AND kind = ?{}", args.len());
        }
        if let Some(owner) = &filter.owner {
            args.push(Value::Text(owner.as_str().to_string()));
            let _ = write!(sql, " AND owner = ?{}", args.len());
        }
        if let Some(status) = filter.item_status {
            args.push(Value::Text(status.as_str().to_string()));
            let _ = write!(
                sql,
                " AND kind = 'lost_found' AND json_extract(payload_json, '$.status') = ?{}",
                args.len()
            );
        }
        if let Some(query) = filter.query_text() {
            args.push(Value::Text(format!("%{}%", escape_like(query))));
            let _ = write!(
                sql,
                " AND (COALESCE(json_extract(payload_json, '$.title'), '') || ' ' ||
                       COALESCE(json_extract(payload_json, '$.description'), '') || ' ' ||
                       COALESCE(json_extract(payload_json, '$.location'), '') || ' ' ||
                       COALESCE(json_extract(payload_json, '$.from'), '') || ' ' ||
                       COALESCE(json_extract(payload_json, '$.to'), '')) LIKE ?{} ESCAPE '\\'",
                args.len()
            );
        }
        if let Some(cursor) = after {
            args.push(Value::Integer(cursor.created_at_ms));
            let created_idx = args.len();
            args.push(Value::Text(cursor.resource_id.clone()));
            let id_idx = args.len();
            let _ = write!(
                sql,
                " AND (created_at_ms < ?{created_idx}
                       OR (created_at_ms = ?{created_idx} AND resource_id < ?{id_idx}))"
            );
        }
        args.push(Value::Integer(limit_to_sql(limit)));
        let _ = write!(
            sql,
            " ORDER BY created_at_ms DESC, resource_id DESC LIMIT ?{}",
            args.len()
        );

        let guard = self.lock()?;
        let mut stmt = guard.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), ResourceRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ResourceRow::decode).collect()
    }

    fn pending_claims_for_owner(&self, owner: &Identity) -> Result<Vec<Claim>, StoreError> {
        let guard = self.lock()?;
        let mut stmt = guard.prepare(&format!(
            "SELECT {CLAIM_COLUMNS} FROM market_claims
             WHERE state = 'pending'
               AND resource_id IN (SELECT resource_id FROM market_resources WHERE owner = ?1)
             ORDER BY created_at_ms ASC, claim_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![owner.as_str()], ClaimRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ClaimRow::decode).collect()
    }

    fn insert_claim(&self, claim: &Claim) -> Result<(), StoreError> {
        let payload_json = serde_json::to_string(&claim.payload)?;
        let guard = self.lock()?;
        let tx = Transaction::new_unchecked(&guard, TransactionBehavior::Immediate)?;

        let bumped = tx.execute(
            "UPDATE market_resources
             SET version = version + 1, updated_at_ms = ?2
             WHERE resource_id = ?1 AND state = 'open'",
            params![claim.resource_id.as_str(), to_millis(claim.created_at)],
        )?;
        if bumped == 0 {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM market_resources WHERE resource_id = ?1",
                    params![claim.resource_id.as_str()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            let resource_id = claim.resource_id.to_string();
            return Err(if exists {
                StoreError::ResourceNotOpen { resource_id }
            } else {
                StoreError::ResourceNotFound { resource_id }
            });
        }

        let inserted = tx.execute(
            "INSERT INTO market_claims
             (claim_id, resource_id, claimant, state, payload_json, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                claim.id.as_str(),
                claim.resource_id.as_str(),
                claim.claimant.as_str(),
                claim.state.as_str(),
                payload_json,
                to_millis(claim.created_at),
                to_millis(claim.updated_at),
            ],
        );
        match inserted {
            Ok(_) => {},
            Err(err) if is_constraint_violation(&err) => {
                return Err(StoreError::DuplicateClaim {
                    resource_id: claim.resource_id.to_string(),
                    claimant: claim.claimant.to_string(),
                });
            },
            Err(err) => return Err(err.into()),
        }
        tx.commit()?;
        Ok(())
    }

    fn commit(&self, changeset: &Changeset, at: DateTime<Utc>) -> Result<(), StoreError> {
        if changeset.is_empty() {
            return Ok(());
        }
        let at_ms = to_millis(at);
        let guard = self.lock()?;
        let tx = Transaction::new_unchecked(&guard, TransactionBehavior::Immediate)?;

        if let Some(change) = changeset.resource {
            let rows = tx.execute(
                "UPDATE market_resources
                 SET state = ?1, version = version + 1, updated_at_ms = ?2
                 WHERE resource_id = ?3 AND state = ?4 AND version = ?5",
                params![
                    change.to.as_str(),
                    at_ms,
                    changeset.resource_id.as_str(),
                    change.from.as_str(),
                    version_to_sql(change.expected_version)?,
                ],
            )?;
            if rows != 1 {
                return Err(StoreError::Stale {
                    reason: format!(
                        "resource {} moved past {} at version {}",
                        changeset.resource_id, change.from, change.expected_version
                    ),
                });
            }
        }

        for change in &changeset.claims {
            let updated = tx.execute(
                "UPDATE market_claims
                 SET state = ?1, updated_at_ms = ?2
                 WHERE claim_id = ?3 AND resource_id = ?4 AND state = ?5",
                params![
                    change.to.as_str(),
                    at_ms,
                    change.claim_id.as_str(),
                    changeset.resource_id.as_str(),
                    change.from.as_str(),
                ],
            );
            let rows = match updated {
                Ok(rows) => rows,
                Err(err) if is_constraint_violation(&err) => {
                    return Err(StoreError::Stale {
                        reason: format!(
                            "resource {} already has an accepted claim",
                            changeset.resource_id
                        ),
                    });
                },
                Err(err) => return Err(err.into()),
            };
            if rows != 1 {
                return Err(StoreError::Stale {
                    reason: format!("claim {} is no longer {}", change.claim_id, change.from),
                });
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn due_resources(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ResourceId>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let guard = self.lock()?;
        let mut stmt = guard.prepare(
            "SELECT resource_id FROM market_resources
             WHERE state = 'open' AND deadline_ms IS NOT NULL AND deadline_ms <= ?1
             ORDER BY deadline_ms ASC, resource_id ASC
             LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![to_millis(now), limit_to_sql(limit)], |row| {
                row.get::<_, String>(0)
            })?
            .map(|id| id.map(ResourceId::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn purge_retired(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let guard = self.lock()?;
        let tx = Transaction::new_unchecked(&guard, TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM market_claims WHERE resource_id IN (
                SELECT resource_id FROM market_resources
                WHERE state IN ('cancelled', 'expired') AND updated_at_ms < ?1
             )",
            params![to_millis(before)],
        )?;
        let purged = tx.execute(
            "DELETE FROM market_resources
             WHERE state IN ('cancelled', 'expired') AND updated_at_ms < ?1",
            params![to_millis(before)],
        )?;
        tx.commit()?;
        Ok(purged)
    }
}

fn read_resource(conn: &Connection, resource_id: &ResourceId) -> Result<Resource, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {RESOURCE_COLUMNS} FROM market_resources WHERE resource_id = ?1"),
            params![resource_id.as_str()],
            ResourceRow::read,
        )
        .optional()?
        .ok_or_else(|| StoreError::ResourceNotFound {
            resource_id: resource_id.to_string(),
        })?;
    row.decode()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn version_to_sql(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Corrupt {
        table: RESOURCES,
        reason: format!("version {version} exceeds i64 range"),
    })
}

fn limit_to_sql(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

struct ResourceRow {
    resource_id: String,
    owner: String,
    kind: String,
    state: String,
    version: i64,
    deadline_ms: Option<i64>,
    payload_json: String,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl ResourceRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            resource_id: row.get(0)?,
            owner: row.get(1)?,
            kind: row.get(2)?,
            state: row.get(3)?,
            version: row.get(4)?,
            deadline_ms: row.get(5)?,
            payload_json: row.get(6)?,
            created_at_ms: row.get(7)?,
            updated_at_ms: row.get(8)?,
        })
    }

    fn decode(self) -> Result<Resource, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            table: RESOURCES,
            reason,
        };
        let payload: ResourcePayload = serde_json::from_str(&self.payload_json)?;
        if payload.kind().as_str() != self.kind {
            return Err(corrupt(format!(
                "resource {} kind column '{}' disagrees with payload kind '{}'",
                self.resource_id,
                self.kind,
                payload.kind()
            )));
        }
        Ok(Resource {
            state: self.state.parse().map_err(corrupt)?,
            version: u64::try_from(self.version)
                .map_err(|_| corrupt(format!("negative version {}", self.version)))?,
            deadline: self
                .deadline_ms
                .map(|ms| from_millis(RESOURCES, ms))
                .transpose()?,
            created_at: from_millis(RESOURCES, self.created_at_ms)?,
            updated_at: from_millis(RESOURCES, self.updated_at_ms)?,
            id: ResourceId::new(self.resource_id),
            owner: Identity::new(self.owner),
            payload,
        })
    }
}

struct ClaimRow {
    claim_id: String,
    resource_id: String,
    claimant: String,
    state: String,
    payload_json: String,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl ClaimRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            claim_id: row.get(0)?,
            resource_id: row.get(1)?,
            claimant: row.get(2)?,
            state: row.get(3)?,
            payload_json: row.get(4)?,
            created_at_ms: row.get(5)?,
            updated_at_ms: row.get(6)?,
        })
    }

    fn decode(self) -> Result<Claim, StoreError> {
        let payload: ClaimPayload = serde_json::from_str(&self.payload_json)?;
        Ok(Claim {
            state: self.state.parse().map_err(|reason| StoreError::Corrupt {
                table: CLAIMS,
                reason,
            })?,
            created_at: from_millis(CLAIMS, self.created_at_ms)?,
            updated_at: from_millis(CLAIMS, self.updated_at_ms)?,
            id: ClaimId::new(self.claim_id),
            resource_id: ResourceId::new(self.resource_id),
            claimant: Identity::new(self.claimant),
            payload,
        })
    }
}
