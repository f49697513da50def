//! Durable expiry sweep.
//!
//! Deadlines live in the store (`market_resources.deadline_ms`, indexed),
//! not in timers, so a restart loses nothing: the next sweep after startup
//! picks up everything that fell due while the process was down.
//!
//! One sweep:
//!
//! 1. reads up to `batch_limit` overdue open resources, earliest first;
//! 2. expires each through [`ArbitrationEngine::expire_resource`], which
//!    takes the resource's critical section and re-checks the deadline;
//!    a resource somebody else already handled is skipped;
//! 3. deletes expired verification tickets;
//! 4. purges long-retired resources if a retention window is configured.
//!
//! A failure on one resource is logged and left for the next sweep.

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::arbitration::ArbitrationEngine;
use crate::config::ExpiryConfig;
use crate::error::ErrorKind;
use crate::ticket::TicketService;

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Resources moved to `Expired`.
    pub resources_expired: usize,
    /// Pending claims cancelled with them.
    pub claims_cancelled: usize,
    /// Expired tickets deleted.
    pub tickets_removed: usize,
    /// Candidates already handled elsewhere or busy.
    pub skipped: usize,
    /// Candidates or steps that failed and will be retried.
    pub failures: usize,
    /// Retired resources physically deleted.
    pub purged: usize,
}

impl SweepReport {
    /// Returns `true` if the sweep changed nothing and hit no errors.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.resources_expired == 0
            && self.tickets_removed == 0
            && self.skipped == 0
            && self.failures == 0
            && self.purged == 0
    }
}

/// Periodic expiry of resources and tickets.
#[derive(Debug)]
pub struct ExpiryScheduler {
    engine: Arc<ArbitrationEngine>,
    tickets: Arc<TicketService>,
    config: ExpiryConfig,
}

impl ExpiryScheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(engine: Arc<ArbitrationEngine>, tickets: Arc<TicketService>, config: ExpiryConfig) -> Self {
        Self {
            engine,
            tickets,
            config,
        }
    }

    /// Time between sweeps.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.config.interval()
    }

    /// Runs one sweep. Never fails; problems are counted and logged.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.engine.clock().now();

        match self
            .engine
            .due_resources(now, self.config.batch_limit)
            .await
        {
            Ok(due) => {
                for resource_id in due {
                    match self.engine.expire_resource(&resource_id).await {
                        Ok(Some(outcome)) => {
                            report.resources_expired += 1;
                            report.claims_cancelled += outcome.cancelled_claims;
                        },
                        Ok(None) => report.skipped += 1,
                        Err(err) if err.kind() == ErrorKind::Conflict => {
                            debug!(resource_id = %resource_id, error = %err, "expiry skipped");
                            report.skipped += 1;
                        },
                        Err(err) => {
                            warn!(resource_id = %resource_id, error = %err, "expiry failed");
                            report.failures += 1;
                        },
                    }
                }
            },
            Err(err) => {
                warn!(error = %err, "failed to read due resources");
                report.failures += 1;
            },
        }

        match self.tickets.purge_expired() {
            Ok(removed) => report.tickets_removed = removed,
            Err(err) => {
                warn!(error = %err, "failed to delete expired tickets");
                report.failures += 1;
            },
        }

        if let Some(cutoff) = self
            .config
            .retention()
            .and_then(|retention| now.checked_sub_signed(retention))
        {
            match self.engine.purge_retired(cutoff) {
                Ok(purged) => report.purged = purged,
                Err(err) => {
                    warn!(error = %err, "failed to purge retired resources");
                    report.failures += 1;
                },
            }
        }

        if !report.is_idle() {
            info!(
                resources_expired = report.resources_expired,
                claims_cancelled = report.claims_cancelled,
                tickets_removed = report.tickets_removed,
                skipped = report.skipped,
                failures = report.failures,
                purged = report.purged,
                "expiry sweep"
            );
        }
        report
    }
}
