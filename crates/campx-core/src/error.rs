//! Caller-facing error taxonomy.
//!
//! Every engine and ticket operation reports one of these synchronously.
//! Callers branch on [`MarketError::kind`] to tell "someone else already won
//! this resource" (`Conflict`) apart from "you are not allowed to decide
//! this" (`Forbidden`) and "this no longer exists" (`NotFound`).

use thiserror::Error;

use crate::store::StoreError;

/// Errors returned by marketplace operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MarketError {
    /// The referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity type (`resource`, `claim`, `ticket`).
        entity: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// The requester may not perform this operation.
    #[error("forbidden: {reason}")]
    Forbidden {
        /// Why the request was refused.
        reason: String,
    },

    /// The operation lost against the current state of the resource.
    ///
    /// Covers already-decided claims, resources no longer open, duplicate
    /// claims, and lost concurrent-update races.
    #[error("conflict: {reason}")]
    Conflict {
        /// What the request collided with.
        reason: String,
    },

    /// A domain payload is malformed or inconsistent with its resource.
    #[error("invalid {field}: {reason}")]
    Validation {
        /// The offending field.
        field: &'static str,
        /// The reason it is invalid.
        reason: String,
    },

    /// A ticket or resource is past its deadline.
    #[error("{entity} {id} expired")]
    Expired {
        /// Entity type.
        entity: &'static str,
        /// The expired identifier.
        id: String,
    },

    /// A verification secret did not match.
    #[error("verification secret does not match")]
    InvalidSecret,

    /// The durable store failed.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Coarse classification of a [`MarketError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown id or key.
    NotFound,
    /// Requester not allowed.
    Forbidden,
    /// State collision.
    Conflict,
    /// Malformed payload.
    Validation,
    /// Deadline passed.
    Expired,
    /// Secret mismatch.
    InvalidSecret,
    /// Store failure.
    Storage,
}

impl MarketError {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Expired { .. } => ErrorKind::Expired,
            Self::InvalidSecret => ErrorKind::InvalidSecret,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    pub(crate) fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for MarketError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ResourceNotFound { resource_id } => Self::NotFound {
                entity: "resource",
                id: resource_id,
            },
            StoreError::ClaimNotFound { claim_id } => Self::NotFound {
                entity: "claim",
                id: claim_id,
            },
            StoreError::Stale { reason } => Self::Conflict { reason },
            StoreError::DuplicateClaim { .. } => {
                Self::conflict("claimant already holds a live claim on this resource")
            },
            StoreError::ResourceNotOpen { .. } => Self::conflict("resource no longer available"),
            other => Self::Storage(other.to_string()),
        }
    }
}
