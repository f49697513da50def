//! Authorization gate.
//!
//! Kept apart from the state machine: the engine runs these checks against
//! the freshly read snapshot on every call, whatever the caller already
//! checked.

use serde::{Deserialize, Serialize};

use crate::error::MarketError;
use crate::model::{Claim, Identity, Resource};

/// Privilege level of a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// Regular marketplace member.
    Member,
    /// Administrator; may decide and withdraw on behalf of owners.
    Admin,
}

/// The authenticated party behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    /// Who is asking.
    pub identity: Identity,
    /// With which privileges.
    pub role: ActorRole,
}

impl Actor {
    /// A regular member.
    #[must_use]
    pub fn member(identity: impl Into<String>) -> Self {
        Self {
            identity: Identity::new(identity),
            role: ActorRole::Member,
        }
    }

    /// An administrator.
    #[must_use]
    pub fn admin(identity: impl Into<String>) -> Self {
        Self {
            identity: Identity::new(identity),
            role: ActorRole::Admin,
        }
    }

    /// Returns `true` for administrators.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == ActorRole::Admin
    }

    fn owns(&self, resource: &Resource) -> bool {
        self.identity == resource.owner
    }
}

fn owner_or_admin(actor: &Actor, resource: &Resource, action: &str) -> Result<(), MarketError> {
    if actor.owns(resource) || actor.is_admin() {
        Ok(())
    } else {
        Err(MarketError::forbidden(format!(
            "only the owner of {} may {action}",
            resource.id
        )))
    }
}

/// Accepting or rejecting claims: owner or admin.
pub fn authorize_decision(actor: &Actor, resource: &Resource) -> Result<(), MarketError> {
    owner_or_admin(actor, resource, "decide its claims")
}

/// Withdrawing a resource: owner or admin.
pub fn authorize_withdrawal(actor: &Actor, resource: &Resource) -> Result<(), MarketError> {
    owner_or_admin(actor, resource, "withdraw it")
}

/// Reading the claims on a resource: owner or admin.
pub fn authorize_claim_listing(actor: &Actor, resource: &Resource) -> Result<(), MarketError> {
    owner_or_admin(actor, resource, "list its claims")
}

/// Reading the pending requests across an owner's resources: that owner or
/// an admin.
pub fn authorize_owner_inbox(actor: &Actor, owner: &Identity) -> Result<(), MarketError> {
    if actor.identity == *owner || actor.is_admin() {
        Ok(())
    } else {
        Err(MarketError::forbidden(format!(
            "only {owner} may list their pending requests"
        )))
    }
}

/// Submitting a claim: anyone but the owner.
pub fn authorize_claim_creation(actor: &Actor, resource: &Resource) -> Result<(), MarketError> {
    if actor.owns(resource) {
        return Err(MarketError::forbidden(
            "owners cannot claim their own resource",
        ));
    }
    Ok(())
}

/// Cancelling a claim: the claimant only.
pub fn authorize_claim_cancel(actor: &Actor, claim: &Claim) -> Result<(), MarketError> {
    if actor.identity != claim.claimant {
        return Err(MarketError::forbidden(format!(
            "only the claimant may cancel {}",
            claim.id
        )));
    }
    Ok(())
}
