//! Fire-and-forget notification of committed state changes.
//!
//! ```text
//! ┌────────────┐ commit ok ┌──────────────┐ deliver() ┌─────────────────────┐
//! │ Changeset  │──────────▶│ events_for() │──────────▶│ NotificationGateway │
//! └────────────┘           └──────────────┘           └─────────────────────┘
//!                                                       │ Err → warn!, drop
//! ```
//!
//! Events are derived from a changeset only after the store has committed
//! it, so a lost race never notifies anybody and each transition is
//! announced at most once. Delivery is best-effort: a gateway failure is
//! logged and dropped, never propagated back into arbitration.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::model::{
    ChangeCause, Changeset, Claim, ClaimId, ClaimState, Identity, ResourceId, ResourceState,
};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A claim was submitted against the subject's resource.
    ClaimSubmitted,
    /// The subject's claim won.
    ClaimAccepted,
    /// The subject's claim lost, directly or by cascade.
    ClaimRejected,
    /// A claim was cancelled (by its claimant, a withdrawal, or expiry).
    ClaimCancelled,
    /// The subject's resource was committed to a claimant.
    ResourceCommitted,
    /// The accepted claim was cancelled and the resource is open again.
    ResourceReopened,
    /// The owner or an admin withdrew the resource.
    ResourceWithdrawn,
    /// The resource passed its deadline.
    ResourceExpired,
}

impl EventKind {
    /// Returns the wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClaimSubmitted => "claim_submitted",
            Self::ClaimAccepted => "claim_accepted",
            Self::ClaimRejected => "claim_rejected",
            Self::ClaimCancelled => "claim_cancelled",
            Self::ResourceCommitted => "resource_committed",
            Self::ResourceReopened => "resource_reopened",
            Self::ResourceWithdrawn => "resource_withdrawn",
            Self::ResourceExpired => "resource_expired",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed state change, addressed to one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketEvent {
    /// What happened.
    pub kind: EventKind,
    /// The resource involved.
    pub resource_id: ResourceId,
    /// The claim involved, if any.
    pub claim_id: Option<ClaimId>,
    /// Who should hear about it.
    pub subject: Identity,
    /// Commit time.
    pub at: DateTime<Utc>,
}

impl MarketEvent {
    /// Event announcing a new pending claim to the resource owner.
    #[must_use]
    pub fn claim_submitted(claim: &Claim, owner: &Identity) -> Self {
        Self {
            kind: EventKind::ClaimSubmitted,
            resource_id: claim.resource_id.clone(),
            claim_id: Some(claim.id.clone()),
            subject: owner.clone(),
            at: claim.created_at,
        }
    }
}

/// Delivery failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NotifyError {
    /// The downstream buffer is full; the event was dropped.
    #[error("notification channel full")]
    ChannelFull,

    /// The downstream consumer is gone.
    #[error("notification channel closed")]
    ChannelClosed,

    /// Any other delivery failure.
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Receives committed-state events.
///
/// Implementations must not block: they are called on the request path
/// right after commit. Buffer or drop rather than wait.
pub trait NotificationGateway: Send + Sync + fmt::Debug {
    /// Hands one event to the downstream consumer.
    fn deliver(&self, event: &MarketEvent) -> Result<(), NotifyError>;
}

/// Gateway that only logs each event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationGateway for TracingNotifier {
    fn deliver(&self, event: &MarketEvent) -> Result<(), NotifyError> {
        info!(
            kind = %event.kind,
            resource_id = %event.resource_id,
            claim_id = event.claim_id.as_ref().map(ClaimId::as_str),
            subject = %event.subject,
            "market event"
        );
        Ok(())
    }
}

/// Gateway that forwards events into a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<MarketEvent>,
}

impl ChannelNotifier {
    /// Creates the notifier and the receiving half of its channel.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MarketEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl NotificationGateway for ChannelNotifier {
    fn deliver(&self, event: &MarketEvent) -> Result<(), NotifyError> {
        self.tx.try_send(event.clone()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => NotifyError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => NotifyError::ChannelClosed,
        })
    }
}

/// Derives one event per transition in a committed changeset.
///
/// Resource transitions are addressed to the owner. Claim transitions are
/// addressed to the claimant, except a claimant's own cancellation, which
/// the owner needs to hear about.
#[must_use]
pub fn events_for(changeset: &Changeset, at: DateTime<Utc>) -> Vec<MarketEvent> {
    let mut events = Vec::with_capacity(changeset.claims.len() + 1);

    for change in &changeset.claims {
        let kind = match change.to {
            ClaimState::Accepted => EventKind::ClaimAccepted,
            ClaimState::Rejected => EventKind::ClaimRejected,
            ClaimState::Cancelled => EventKind::ClaimCancelled,
            ClaimState::Pending => continue,
        };
        let subject = if change.cause == ChangeCause::ClaimantCancel {
            changeset.owner.clone()
        } else {
            change.claimant.clone()
        };
        events.push(MarketEvent {
            kind,
            resource_id: changeset.resource_id.clone(),
            claim_id: Some(change.claim_id.clone()),
            subject,
            at,
        });
    }

    if let Some(change) = changeset.resource {
        let kind = match change.to {
            ResourceState::Committed => EventKind::ResourceCommitted,
            ResourceState::Open => EventKind::ResourceReopened,
            ResourceState::Cancelled => EventKind::ResourceWithdrawn,
            ResourceState::Expired => EventKind::ResourceExpired,
        };
        events.push(MarketEvent {
            kind,
            resource_id: changeset.resource_id.clone(),
            claim_id: None,
            subject: changeset.owner.clone(),
            at,
        });
    }

    events
}

/// Delivers `events`, logging and dropping failures.
///
/// Returns how many were accepted by the gateway.
pub fn dispatch(gateway: &dyn NotificationGateway, events: &[MarketEvent]) -> usize {
    let mut delivered = 0;
    for event in events {
        match gateway.deliver(event) {
            Ok(()) => delivered += 1,
            Err(err) => warn!(
                kind = %event.kind,
                resource_id = %event.resource_id,
                subject = %event.subject,
                error = %err,
                "notification dropped"
            ),
        }
    }
    delivered
}
