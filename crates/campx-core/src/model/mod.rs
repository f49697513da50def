//! Marketplace data model.
//!
//! - [`Resource`]: a claimable offer and its lifecycle state
//! - [`Claim`]: one claimant's request against one resource
//! - [`payload`]: the domain payloads (rides, lost-and-found posts) that the
//!   engine carries but does not interpret beyond validation
//! - [`Changeset`]: the set of state transitions one arbitration step commits
//!
//! # State Machines
//!
//! ```text
//! Resource:  Open ──▶ Committed ──▶ Open      (accepted claim cancelled)
//!             │
//!             ├──▶ Cancelled   (terminal, owner withdrawal)
//!             └──▶ Expired     (terminal, deadline sweep)
//!
//! Claim:     Pending ──▶ Accepted ──▶ Cancelled
//!               │
//!               ├──▶ Rejected  (terminal)
//!               └──▶ Cancelled (terminal)
//! ```

mod claim;
pub mod payload;
mod resource;
mod transition;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use claim::{Claim, ClaimState};
pub use payload::{
    ClaimPayload, ClaimRequest, DeadlinePolicy, ItemStatus, LostFoundPost, ResourceKind,
    ResourcePayload, RideOffer, ViaStop,
};
pub use resource::{Resource, ResourceState};
pub use transition::{ChangeCause, Changeset, ClaimChange, ResourceChange, ResourceSnapshot};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix carried by freshly generated identifiers.
            pub const PREFIX: &'static str = $prefix;

            /// Generates a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!("{}{}", Self::PREFIX, uuid::Uuid::new_v4()))
            }

            /// Wraps an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Opaque resource identifier (`RES-<uuid>`).
    ResourceId,
    "RES-"
);
string_id!(
    /// Opaque claim identifier (`CLM-<uuid>`).
    ClaimId,
    "CLM-"
);

/// Identity of a marketplace member (owner or claimant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wraps a member identity.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_and_differ() {
        let a = ResourceId::generate();
        let b = ResourceId::generate();
        assert!(a.as_str().starts_with("RES-"));
        assert_ne!(a, b);
        assert!(ClaimId::generate().as_str().starts_with("CLM-"));
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = ClaimId::new("CLM-fixed");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"CLM-fixed\"");
    }
}
