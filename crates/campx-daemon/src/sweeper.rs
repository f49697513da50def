//! Recurring expiry loop.
//!
//! The first sweep runs immediately on startup so that anything which fell
//! due while the daemon was down is handled before the first interval
//! elapses. Ticks missed while a sweep overruns are skipped, not queued.

use std::sync::Arc;
use std::time::Duration;

use campx_core::ExpiryScheduler;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::state::SharedState;

/// Runs sweeps every `period` until shutdown is requested.
pub async fn run(scheduler: Arc<ExpiryScheduler>, state: SharedState, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_secs = period.as_secs(), "expiry sweeper started");

    loop {
        interval.tick().await;

        if state.is_shutdown_requested() {
            info!(sweeps = state.sweeps(), "expiry sweeper shutting down");
            break;
        }

        let report = scheduler.sweep().await;
        state.record_sweep(&report);
        debug!(idle = report.is_idle(), "sweep complete");
    }
}
