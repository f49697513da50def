//! Shared daemon state.
//!
//! Provides thread-safe shared state for the daemon.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use campx_core::SweepReport;
use chrono::{DateTime, Utc};

/// Shared daemon state.
pub type SharedState = Arc<DaemonStateHandle>;

/// Handle to daemon state with interior mutability.
#[derive(Debug)]
pub struct DaemonStateHandle {
    /// Shutdown flag (atomic for lock-free checking).
    shutdown: AtomicBool,
    /// Time when the daemon started.
    started_at: DateTime<Utc>,
    sweeps: AtomicU64,
    resources_expired: AtomicU64,
    sweep_failures: AtomicU64,
}

impl DaemonStateHandle {
    /// Create a new daemon state handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            started_at: Utc::now(),
            sweeps: AtomicU64::new(0),
            resources_expired: AtomicU64::new(0),
            sweep_failures: AtomicU64::new(0),
        }
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Get the daemon start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Get daemon uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Folds one sweep's counters into the running totals.
    pub fn record_sweep(&self, report: &SweepReport) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.resources_expired
            .fetch_add(report.resources_expired as u64, Ordering::Relaxed);
        self.sweep_failures
            .fetch_add(report.failures as u64, Ordering::Relaxed);
    }

    /// Number of completed sweeps.
    #[must_use]
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Resources expired since startup.
    #[must_use]
    pub fn resources_expired(&self) -> u64 {
        self.resources_expired.load(Ordering::Relaxed)
    }

    /// Sweep failures since startup.
    #[must_use]
    pub fn sweep_failures(&self) -> u64 {
        self.sweep_failures.load(Ordering::Relaxed)
    }
}

impl Default for DaemonStateHandle {
    fn default() -> Self {
        Self::new()
    }
}
