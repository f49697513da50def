//! Per-resource async critical sections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::MarketError;
use crate::model::ResourceId;

/// Slot count above which dead entries are pruned on insert.
const PRUNE_THRESHOLD: usize = 1024;

/// Map of resource id to a weakly held async mutex.
///
/// A slot lives only while some task holds or waits on it, so the map does
/// not grow with the number of resources ever touched.
#[derive(Debug, Default)]
pub struct ResourceLocks {
    slots: Mutex<HashMap<ResourceId, Weak<AsyncMutex<()>>>>,
}

/// Exclusive access to one resource; released on drop.
#[derive(Debug)]
pub struct ResourceGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ResourceLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for exclusive access to `resource_id`.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::Conflict`] if the resource stays busy for the
    /// whole timeout.
    pub async fn acquire(
        &self,
        resource_id: &ResourceId,
        timeout: Duration,
    ) -> Result<ResourceGuard, MarketError> {
        let slot = self.slot(resource_id);
        tokio::time::timeout(timeout, slot.lock_owned())
            .await
            .map(|guard| ResourceGuard { _guard: guard })
            .map_err(|_| MarketError::conflict(format!("resource {resource_id} is busy")))
    }

    /// Number of live slots.
    #[must_use]
    pub fn tracked(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|slot| slot.strong_count() > 0).count()
    }

    fn slot(&self, resource_id: &ResourceId) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(live) = slots.get(resource_id).and_then(Weak::upgrade) {
            return live;
        }
        if slots.len() >= PRUNE_THRESHOLD {
            slots.retain(|_, slot| slot.strong_count() > 0);
        }
        let slot = Arc::new(AsyncMutex::new(()));
        slots.insert(resource_id.clone(), Arc::downgrade(&slot));
        slot
    }
}
