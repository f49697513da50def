//! Snapshots and changesets.
//!
//! Arbitration reads a [`ResourceSnapshot`], plans a [`Changeset`] against
//! it, and hands the changeset to the store, which applies every transition
//! in one transaction conditioned on the snapshot still being current.

use chrono::{DateTime, Utc};

use super::{Claim, ClaimId, ClaimState, Identity, Resource, ResourceId, ResourceState};
use crate::error::MarketError;

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeCause {
    /// The owner accepted or rejected this claim.
    OwnerDecision,
    /// Another claim on the same resource was accepted.
    Cascade,
    /// The claimant withdrew the claim.
    ClaimantCancel,
    /// The owner withdrew the resource.
    OwnerWithdrawal,
    /// The resource deadline passed.
    Expiry,
}

/// A planned resource transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceChange {
    /// State observed in the snapshot.
    pub from: ResourceState,
    /// Target state.
    pub to: ResourceState,
    /// Version observed in the snapshot; the write only applies if the
    /// stored version still matches.
    pub expected_version: u64,
}

/// A planned claim transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimChange {
    /// The claim.
    pub claim_id: ClaimId,
    /// The claimant (notification subject).
    pub claimant: Identity,
    /// State observed in the snapshot.
    pub from: ClaimState,
    /// Target state.
    pub to: ClaimState,
    /// Why the claim moves.
    pub cause: ChangeCause,
}

impl ClaimChange {
    /// Plans `claim → to`, refusing transitions the claim lifecycle forbids.
    pub fn new(claim: &Claim, to: ClaimState, cause: ChangeCause) -> Result<Self, MarketError> {
        if !claim.state.can_transition_to(to) {
            return Err(MarketError::conflict(format!(
                "claim {} cannot move from {} to {to}",
                claim.id, claim.state
            )));
        }
        Ok(Self {
            claim_id: claim.id.clone(),
            claimant: claim.claimant.clone(),
            from: claim.state,
            to,
            cause,
        })
    }
}

/// All transitions committed by one arbitration step on one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset {
    /// The resource every change belongs to.
    pub resource_id: ResourceId,
    /// Owner of the resource (notification subject for resource changes).
    pub owner: Identity,
    /// Resource transition, if the step moves the resource.
    pub resource: Option<ResourceChange>,
    /// Claim transitions.
    pub claims: Vec<ClaimChange>,
    /// Why the resource moves (ignored when `resource` is `None`).
    pub cause: ChangeCause,
}

impl Changeset {
    /// Starts an empty changeset for `resource`.
    #[must_use]
    pub fn on(resource: &Resource, cause: ChangeCause) -> Self {
        Self {
            resource_id: resource.id.clone(),
            owner: resource.owner.clone(),
            resource: None,
            claims: Vec::new(),
            cause,
        }
    }

    /// Plans `resource → to` at the snapshot's version.
    pub fn move_resource(mut self, resource: &Resource, to: ResourceState) -> Result<Self, MarketError> {
        if !resource.state.can_transition_to(to) {
            return Err(MarketError::conflict(format!(
                "resource {} cannot move from {} to {to}",
                resource.id, resource.state
            )));
        }
        self.resource = Some(ResourceChange {
            from: resource.state,
            to,
            expected_version: resource.version,
        });
        Ok(self)
    }

    /// Adds a claim transition.
    #[must_use]
    pub fn with_claim(mut self, change: ClaimChange) -> Self {
        self.claims.push(change);
        self
    }

    /// Returns `true` if nothing would be written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resource.is_none() && self.claims.is_empty()
    }
}

/// A consistent read of one resource and every claim against it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    /// The resource.
    pub resource: Resource,
    /// All claims on the resource, oldest first.
    pub claims: Vec<Claim>,
}

impl ResourceSnapshot {
    /// Looks up a claim in the snapshot.
    #[must_use]
    pub fn claim(&self, claim_id: &ClaimId) -> Option<&Claim> {
        self.claims.iter().find(|claim| &claim.id == claim_id)
    }

    /// Iterates over claims in `state`.
    pub fn claims_in(&self, state: ClaimState) -> impl Iterator<Item = &Claim> {
        self.claims.iter().filter(move |claim| claim.state == state)
    }

    /// Returns the snapshot as it reads after `changeset` commits at `at`.
    #[must_use]
    pub fn apply(mut self, changeset: &Changeset, at: DateTime<Utc>) -> Self {
        if let Some(change) = changeset.resource {
            self.resource.state = change.to;
            self.resource.version = change.expected_version + 1;
            self.resource.updated_at = at;
        }
        for change in &changeset.claims {
            if let Some(claim) = self.claims.iter_mut().find(|c| c.id == change.claim_id) {
                claim.state = change.to;
                claim.updated_at = at;
            }
        }
        self
    }
}
