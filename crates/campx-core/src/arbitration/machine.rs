//! Pure arbitration planning.
//!
//! Each function reads a [`ResourceSnapshot`] and returns the [`Changeset`]
//! that one step would commit, or the error that step must report. Nothing
//! here touches the store or the clock.

use chrono::{DateTime, Utc};

use crate::error::MarketError;
use crate::model::{
    ChangeCause, Changeset, ClaimChange, ClaimId, ClaimState, ResourceSnapshot, ResourceState,
};

/// Owner verdict on a pending claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Commit the resource to this claim and reject every other pending one.
    Accept,
    /// Reject this claim only.
    Reject,
}

fn claim_not_found(claim_id: &ClaimId) -> MarketError {
    MarketError::NotFound {
        entity: "claim",
        id: claim_id.to_string(),
    }
}

/// Plans an accept or reject of `claim_id`.
pub fn plan_decision(
    snapshot: &ResourceSnapshot,
    claim_id: &ClaimId,
    decision: Decision,
    now: DateTime<Utc>,
) -> Result<Changeset, MarketError> {
    let resource = &snapshot.resource;
    let claim = snapshot
        .claim(claim_id)
        .ok_or_else(|| claim_not_found(claim_id))?;
    if claim.state != ClaimState::Pending {
        return Err(MarketError::conflict("claim already decided"));
    }

    match decision {
        Decision::Reject => Ok(Changeset::on(resource, ChangeCause::OwnerDecision).with_claim(
            ClaimChange::new(claim, ClaimState::Rejected, ChangeCause::OwnerDecision)?,
        )),
        Decision::Accept => {
            if resource.state != ResourceState::Open {
                return Err(MarketError::conflict("resource no longer available"));
            }
            if resource.is_overdue(now) {
                return Err(MarketError::Expired {
                    entity: "resource",
                    id: resource.id.to_string(),
                });
            }
            let mut changeset = Changeset::on(resource, ChangeCause::OwnerDecision)
                .move_resource(resource, ResourceState::Committed)?
                .with_claim(ClaimChange::new(
                    claim,
                    ClaimState::Accepted,
                    ChangeCause::OwnerDecision,
                )?);
            for loser in snapshot
                .claims_in(ClaimState::Pending)
                .filter(|other| other.id != claim.id)
            {
                changeset = changeset.with_claim(ClaimChange::new(
                    loser,
                    ClaimState::Rejected,
                    ChangeCause::Cascade,
                )?);
            }
            Ok(changeset)
        },
    }
}

/// Plans a claimant's cancellation of `claim_id`.
///
/// Cancelling the accepted claim also moves the resource from `Committed`
/// back to `Open`, so other parties can claim it again.
pub fn plan_claim_cancel(
    snapshot: &ResourceSnapshot,
    claim_id: &ClaimId,
) -> Result<Changeset, MarketError> {
    let resource = &snapshot.resource;
    let claim = snapshot
        .claim(claim_id)
        .ok_or_else(|| claim_not_found(claim_id))?;
    let cancel = ClaimChange::new(claim, ClaimState::Cancelled, ChangeCause::ClaimantCancel)
        .map_err(|_| MarketError::conflict(format!("claim {claim_id} is already {}", claim.state)))?;

    let changeset = Changeset::on(resource, ChangeCause::ClaimantCancel);
    match claim.state {
        ClaimState::Accepted => {
            if resource.state != ResourceState::Committed {
                return Err(MarketError::conflict(format!(
                    "resource {} is {}, not committed",
                    resource.id, resource.state
                )));
            }
            Ok(changeset
                .move_resource(resource, ResourceState::Open)?
                .with_claim(cancel))
        },
        _ => Ok(changeset.with_claim(cancel)),
    }
}

/// Plans the owner's withdrawal of an open resource, cancelling every
/// pending claim on it.
pub fn plan_withdrawal(snapshot: &ResourceSnapshot) -> Result<Changeset, MarketError> {
    let resource = &snapshot.resource;
    if resource.state != ResourceState::Open {
        return Err(MarketError::conflict(format!(
            "resource {} is {} and cannot be withdrawn",
            resource.id, resource.state
        )));
    }
    cancel_pending(
        snapshot,
        Changeset::on(resource, ChangeCause::OwnerWithdrawal)
            .move_resource(resource, ResourceState::Cancelled)?,
        ChangeCause::OwnerWithdrawal,
    )
}

/// Plans the expiry of an overdue resource.
///
/// Returns `None` if the resource is not open or not yet due, which makes
/// repeated sweeps no-ops.
pub fn plan_expiry(
    snapshot: &ResourceSnapshot,
    now: DateTime<Utc>,
) -> Result<Option<Changeset>, MarketError> {
    let resource = &snapshot.resource;
    if !resource.is_overdue(now) {
        return Ok(None);
    }
    cancel_pending(
        snapshot,
        Changeset::on(resource, ChangeCause::Expiry)
            .move_resource(resource, ResourceState::Expired)?,
        ChangeCause::Expiry,
    )
    .map(Some)
}

fn cancel_pending(
    snapshot: &ResourceSnapshot,
    mut changeset: Changeset,
    cause: ChangeCause,
) -> Result<Changeset, MarketError> {
    for claim in snapshot.claims_in(ClaimState::Pending) {
        changeset = changeset.with_claim(ClaimChange::new(claim, ClaimState::Cancelled, cause)?);
    }
    Ok(changeset)
}
