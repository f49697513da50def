//! Claimable resources.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::{ResourceKind, ResourcePayload};
use super::{Identity, ResourceId};

/// Lifecycle state of a [`Resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Accepting claims.
    Open,
    /// Exactly one claim has been accepted.
    Committed,
    /// Withdrawn by its owner (terminal).
    Cancelled,
    /// Deadline passed while open (terminal).
    Expired,
}

impl ResourceState {
    /// Returns the storage label for this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Returns `true` for states no transition leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }

    /// Returns `true` if `self → next` is an allowed transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Committed | Self::Cancelled | Self::Expired)
                | (Self::Committed, Self::Open)
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "committed" => Ok(Self::Committed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown resource state '{other}'")),
        }
    }
}

/// A claimable offer advertised by its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource identifier.
    pub id: ResourceId,
    /// Member who advertised the resource and decides its claims.
    pub owner: Identity,
    /// Current lifecycle state.
    pub state: ResourceState,
    /// Optimistic-concurrency token. Bumped on every state change and on
    /// every claim insertion.
    pub version: u64,
    /// Instant after which an open resource expires, if any.
    pub deadline: Option<DateTime<Utc>>,
    /// Domain payload.
    pub payload: ResourcePayload,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last committed change.
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// Builds a freshly advertised, open resource.
    #[must_use]
    pub fn open(
        owner: Identity,
        payload: ResourcePayload,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ResourceId::generate(),
            owner,
            state: ResourceState::Open,
            version: 0,
            deadline,
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the kind of the payload.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.payload.kind()
    }

    /// Returns `true` if the resource is open but its deadline has passed.
    ///
    /// Such a resource is logically expired even before a sweep has
    /// persisted the transition.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.state == ResourceState::Open && self.deadline.is_some_and(|deadline| deadline <= now)
    }
}
