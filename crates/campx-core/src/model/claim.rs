//! Claims against resources.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::ClaimPayload;
use super::{ClaimId, Identity, ResourceId};

/// Lifecycle state of a [`Claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    /// Awaiting the owner's decision.
    Pending,
    /// The single winning claim of a committed resource.
    Accepted,
    /// Declined by the owner, or lost to another accepted claim (terminal).
    Rejected,
    /// Withdrawn by the claimant or retired with its resource (terminal).
    Cancelled,
}

impl ClaimState {
    /// Returns the storage label for this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns `true` while the claim counts against the per-claimant
    /// uniqueness rule.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Accepted)
    }

    /// Returns `true` if `self → next` is an allowed transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Accepted | Self::Rejected | Self::Cancelled)
                | (Self::Accepted, Self::Cancelled)
        )
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown claim state '{other}'")),
        }
    }
}

/// A request by one claimant against one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Claim identifier.
    pub id: ClaimId,
    /// The contested resource.
    pub resource_id: ResourceId,
    /// Member who submitted the claim.
    pub claimant: Identity,
    /// Current lifecycle state.
    pub state: ClaimState,
    /// Domain payload (resolved booking tier or claim message).
    pub payload: ClaimPayload,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Time of the last committed change.
    pub updated_at: DateTime<Utc>,
}

impl Claim {
    /// Builds a new pending claim.
    #[must_use]
    pub fn pending(
        resource_id: ResourceId,
        claimant: Identity,
        payload: ClaimPayload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ClaimId::generate(),
            resource_id,
            claimant,
            state: ClaimState::Pending,
            payload,
            created_at: now,
            updated_at: now,
        }
    }
}
