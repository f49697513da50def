//! Claim arbitration engine.
//!
//! Every read-then-write of a resource's state goes through
//! [`ArbitrationEngine`], which serializes it twice over:
//!
//! 1. **In-process**: a per-resource async lock ([`ResourceLocks`]) with a
//!    bounded wait. A busy resource fails fast with `Conflict`.
//! 2. **In the store**: the planned [`Changeset`] commits only if the
//!    resource version and every claim state still match the snapshot it
//!    was planned against. A stale plan is re-planned from a fresh
//!    snapshot a bounded number of times, then reported as `Conflict`.
//!
//! Notifications are derived from the committed changeset and dispatched
//! after commit, outside any transaction.
//!
//! Store calls made while a resource lock is held run on tokio's blocking
//! pool; a database busy with another process (up to `store.busy_timeout_ms`)
//! parks a blocking thread, not a runtime worker.

mod authz;
mod locks;
mod machine;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

pub use authz::{
    authorize_claim_cancel, authorize_claim_creation, authorize_claim_listing,
    authorize_decision, authorize_owner_inbox, authorize_withdrawal, Actor, ActorRole,
};
pub use locks::{ResourceGuard, ResourceLocks};
pub use machine::{plan_claim_cancel, plan_decision, plan_expiry, plan_withdrawal, Decision};

use crate::clock::Clock;
use crate::config::MarketConfig;
use crate::error::MarketError;
use crate::model::{
    ChangeCause, Changeset, Claim, ClaimId, ClaimRequest, DeadlinePolicy, Identity, Resource,
    ResourceId, ResourcePayload, ResourceSnapshot, ResourceState,
};
use crate::notify::{dispatch, events_for, MarketEvent, NotificationGateway};
use crate::store::{ListFilter, MarketStore, OpenResources, StoreError};

/// Result of a committed [`ArbitrationEngine::decide`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutcome {
    /// The decided claim, as committed.
    pub claim: Claim,
    /// The resource, as committed.
    pub resource: Resource,
    /// Claims rejected by cascade (accept only).
    pub cascaded: Vec<ClaimId>,
}

/// Result of a committed [`ArbitrationEngine::cancel_claim`].
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    /// The cancelled claim.
    pub claim: Claim,
    /// `true` if the claim was the accepted one and the resource reopened.
    pub reopened: bool,
}

/// Result of a committed [`ArbitrationEngine::expire_resource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryOutcome {
    /// The expired resource.
    pub resource_id: ResourceId,
    /// Pending claims cancelled with it.
    pub cancelled_claims: usize,
}

struct Committed {
    snapshot: ResourceSnapshot,
    changeset: Changeset,
}

/// Serializes all state transitions of marketplace resources.
#[derive(Debug)]
pub struct ArbitrationEngine {
    store: Arc<dyn MarketStore>,
    notifier: Arc<dyn NotificationGateway>,
    clock: Arc<dyn Clock>,
    locks: ResourceLocks,
    lock_timeout: Duration,
    max_commit_attempts: u32,
    policy: DeadlinePolicy,
}

impl ArbitrationEngine {
    /// Creates an engine over `store`.
    #[must_use]
    pub fn new(
        store: Arc<dyn MarketStore>,
        notifier: Arc<dyn NotificationGateway>,
        clock: Arc<dyn Clock>,
        config: &MarketConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            locks: ResourceLocks::new(),
            lock_timeout: config.arbitration.lock_timeout(),
            max_commit_attempts: config.arbitration.max_commit_attempts.max(1),
            policy: config.deadline_policy(),
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MarketStore> {
        &self.store
    }

    /// The engine's time source.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of resources with a live in-process lock slot.
    #[must_use]
    pub fn locked_resources(&self) -> usize {
        self.locks.tracked()
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Advertises a new resource owned by `actor`.
    ///
    /// The deadline is derived from the payload: the evening cutoff of a
    /// ride's departure day, or the retention window of a lost-and-found
    /// post.
    pub fn create_resource(
        &self,
        actor: &Actor,
        payload: ResourcePayload,
    ) -> Result<Resource, MarketError> {
        payload.validate()?;
        let now = self.clock.now();
        let deadline = self.policy.deadline_for(&payload, now)?;
        let resource = Resource::open(actor.identity.clone(), payload, deadline, now);
        self.store.insert_resource(&resource)?;
        info!(
            resource_id = %resource.id,
            owner = %resource.owner,
            kind = %resource.kind(),
            deadline = ?resource.deadline,
            "resource opened"
        );
        Ok(resource)
    }

    /// Reads a resource.
    pub fn resource(&self, resource_id: &ResourceId) -> Result<Resource, MarketError> {
        Ok(self.store.resource(resource_id)?)
    }

    /// Lists open, not-yet-overdue resources newest first.
    #[must_use]
    pub fn list_open(&self, filter: ListFilter) -> OpenResources {
        OpenResources::new(Arc::clone(&self.store), filter, self.clock.now())
    }

    /// Withdraws an open resource, cancelling its pending claims.
    pub async fn withdraw_resource(
        &self,
        actor: &Actor,
        resource_id: &ResourceId,
    ) -> Result<Resource, MarketError> {
        let done = self
            .arbitrate(resource_id, |snapshot, _| {
                authorize_withdrawal(actor, &snapshot.resource)?;
                plan_withdrawal(snapshot).map(Some)
            })
            .await?
            .ok_or_else(|| nothing_committed(resource_id))?;
        info!(
            resource_id = %resource_id,
            by = %actor.identity,
            cancelled_claims = done.changeset.claims.len(),
            "resource withdrawn"
        );
        Ok(done.snapshot.resource)
    }

    /// Expires `resource_id` if it is open and past its deadline.
    ///
    /// Returns `None` when there is nothing to do: the resource is not yet
    /// due, was committed, or another worker already expired it.
    pub async fn expire_resource(
        &self,
        resource_id: &ResourceId,
    ) -> Result<Option<ExpiryOutcome>, MarketError> {
        let Some(done) = self.arbitrate(resource_id, plan_expiry).await? else {
            return Ok(None);
        };
        let cancelled_claims = done.changeset.claims.len();
        info!(resource_id = %resource_id, cancelled_claims, "resource expired");
        Ok(Some(ExpiryOutcome {
            resource_id: resource_id.clone(),
            cancelled_claims,
        }))
    }

    /// Open resources whose deadline is at or before `now`, earliest first.
    pub async fn due_resources(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ResourceId>, MarketError> {
        Ok(self
            .on_store(move |store| store.due_resources(now, limit))
            .await?)
    }

    /// Physically deletes withdrawn and expired resources that retired
    /// before `before`.
    pub fn purge_retired(&self, before: DateTime<Utc>) -> Result<usize, MarketError> {
        let purged = self.store.purge_retired(before)?;
        if purged > 0 {
            info!(purged, before = %before, "retired resources purged");
        }
        Ok(purged)
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Submits a claim by `actor` against an open resource.
    pub async fn create_claim(
        &self,
        actor: &Actor,
        resource_id: &ResourceId,
        request: ClaimRequest,
    ) -> Result<Claim, MarketError> {
        let guard = self.locks.acquire(resource_id, self.lock_timeout).await?;
        let id = resource_id.clone();
        let resource = self.on_store(move |store| store.resource(&id)).await?;
        authorize_claim_creation(actor, &resource)?;

        let now = self.clock.now();
        if resource.state != ResourceState::Open {
            return Err(MarketError::conflict("resource no longer available"));
        }
        if resource.is_overdue(now) {
            return Err(MarketError::Expired {
                entity: "resource",
                id: resource_id.to_string(),
            });
        }
        let payload = request.resolve(&resource.payload)?;
        let claim = Claim::pending(resource.id.clone(), actor.identity.clone(), payload, now);
        let claim = self
            .on_store(move |store| store.insert_claim(&claim).map(|()| claim))
            .await?;
        drop(guard);

        info!(
            claim_id = %claim.id,
            resource_id = %resource_id,
            claimant = %claim.claimant,
            "claim submitted"
        );
        dispatch(
            self.notifier.as_ref(),
            &[MarketEvent::claim_submitted(&claim, &resource.owner)],
        );
        Ok(claim)
    }

    /// Reads a claim.
    pub fn claim(&self, claim_id: &ClaimId) -> Result<Claim, MarketError> {
        Ok(self.store.claim(claim_id)?)
    }

    /// Lists every claim on a resource, oldest first. Owner or admin only.
    pub fn list_claims(
        &self,
        actor: &Actor,
        resource_id: &ResourceId,
    ) -> Result<Vec<Claim>, MarketError> {
        let snapshot = self.store.snapshot(resource_id)?;
        authorize_claim_listing(actor, &snapshot.resource)?;
        Ok(snapshot.claims)
    }

    /// Lists the pending claims across every resource `owner` advertises,
    /// oldest first. That owner or an admin only.
    pub fn pending_claims_for_owner(
        &self,
        actor: &Actor,
        owner: &Identity,
    ) -> Result<Vec<Claim>, MarketError> {
        authorize_owner_inbox(actor, owner)?;
        Ok(self.store.pending_claims_for_owner(owner)?)
    }

    /// Accepts or rejects a pending claim.
    ///
    /// Accepting commits the resource to the claimant and rejects every
    /// other pending claim in the same transaction. A claim that is no
    /// longer pending fails with `Conflict` and emits nothing.
    pub async fn decide(
        &self,
        actor: &Actor,
        claim_id: &ClaimId,
        decision: Decision,
    ) -> Result<DecisionOutcome, MarketError> {
        let resource_id = self.claim_resource(claim_id).await?;
        let done = self
            .arbitrate(&resource_id, |snapshot, now| {
                authorize_decision(actor, &snapshot.resource)?;
                plan_decision(snapshot, claim_id, decision, now).map(Some)
            })
            .await?
            .ok_or_else(|| nothing_committed(&resource_id))?;

        let cascaded: Vec<ClaimId> = done
            .changeset
            .claims
            .iter()
            .filter(|change| change.cause == ChangeCause::Cascade)
            .map(|change| change.claim_id.clone())
            .collect();
        let claim = done
            .snapshot
            .claim(claim_id)
            .cloned()
            .ok_or_else(|| MarketError::NotFound {
                entity: "claim",
                id: claim_id.to_string(),
            })?;
        info!(
            claim_id = %claim_id,
            resource_id = %resource_id,
            decision = ?decision,
            by = %actor.identity,
            cascaded = cascaded.len(),
            "claim decided"
        );
        Ok(DecisionOutcome {
            claim,
            resource: done.snapshot.resource,
            cascaded,
        })
    }

    /// Cancels the actor's own claim.
    ///
    /// A pending claim is simply cancelled. Cancelling the accepted claim
    /// also reopens the resource.
    pub async fn cancel_claim(
        &self,
        actor: &Actor,
        claim_id: &ClaimId,
    ) -> Result<CancelOutcome, MarketError> {
        let resource_id = self.claim_resource(claim_id).await?;
        let done = self
            .arbitrate(&resource_id, |snapshot, _| {
                let claim = snapshot.claim(claim_id).ok_or_else(|| MarketError::NotFound {
                    entity: "claim",
                    id: claim_id.to_string(),
                })?;
                authorize_claim_cancel(actor, claim)?;
                plan_claim_cancel(snapshot, claim_id).map(Some)
            })
            .await?
            .ok_or_else(|| nothing_committed(&resource_id))?;

        let reopened = done.changeset.resource.is_some();
        let claim = done
            .snapshot
            .claim(claim_id)
            .cloned()
            .ok_or_else(|| MarketError::NotFound {
                entity: "claim",
                id: claim_id.to_string(),
            })?;
        info!(
            claim_id = %claim_id,
            resource_id = %resource_id,
            reopened,
            "claim cancelled"
        );
        Ok(CancelOutcome { claim, reopened })
    }

    // =========================================================================
    // Critical section
    // =========================================================================

    /// Runs `plan` against fresh snapshots of `resource_id` under its lock
    /// until the resulting changeset commits or the plan declines. Gives up
    /// with `Conflict` once the attempt budget is spent. Events are
    /// dispatched after the lock is released.
    async fn arbitrate<F>(
        &self,
        resource_id: &ResourceId,
        mut plan: F,
    ) -> Result<Option<Committed>, MarketError>
    where
        F: FnMut(&ResourceSnapshot, DateTime<Utc>) -> Result<Option<Changeset>, MarketError>,
    {
        let guard = self.locks.acquire(resource_id, self.lock_timeout).await?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let id = resource_id.clone();
            let snapshot = self.on_store(move |store| store.snapshot(&id)).await?;
            let now = self.clock.now();
            let Some(changeset) = plan(&snapshot, now)? else {
                return Ok(None);
            };
            let committed = self
                .on_store(move |store| store.commit(&changeset, now).map(|()| changeset))
                .await;
            match committed {
                Ok(changeset) => {
                    drop(guard);
                    dispatch(self.notifier.as_ref(), &events_for(&changeset, now));
                    return Ok(Some(Committed {
                        snapshot: snapshot.apply(&changeset, now),
                        changeset,
                    }));
                },
                Err(StoreError::Stale { reason }) if attempt < self.max_commit_attempts => {
                    debug!(
                        resource_id = %resource_id,
                        attempt,
                        reason = %reason,
                        "stale snapshot, re-planning"
                    );
                },
                Err(err) => {
                    if matches!(err, StoreError::Stale { .. }) {
                        warn!(
                            resource_id = %resource_id,
                            attempts = attempt,
                            "giving up after repeated stale commits"
                        );
                    }
                    return Err(err.into());
                },
            }
        }
    }
}

impl ArbitrationEngine {
    /// Runs `op` against the store on the blocking pool.
    async fn on_store<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn MarketStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|err| StoreError::Blocking(err.to_string()))?
    }

    async fn claim_resource(&self, claim_id: &ClaimId) -> Result<ResourceId, MarketError> {
        let id = claim_id.clone();
        let claim = self.on_store(move |store| store.claim(&id)).await?;
        Ok(claim.resource_id)
    }
}

fn nothing_committed(resource_id: &ResourceId) -> MarketError {
    MarketError::conflict(format!("no transition to commit on {resource_id}"))
}
