//! Lazy, resumable listing of open resources.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MarketStore, StoreError};
use crate::model::{Identity, ItemStatus, Resource, ResourceKind};

/// Page size used when a filter does not set one.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Upper bound on a single page fetch.
pub const MAX_PAGE_SIZE: usize = 200;

/// Selection criteria for [`OpenResources`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    /// Only resources of this kind.
    #[serde(default)]
    pub kind: Option<ResourceKind>,
    /// Only resources advertised by this owner.
    #[serde(default)]
    pub owner: Option<Identity>,
    /// Only lost-and-found posts with this status. Implies
    /// [`ResourceKind::LostFound`].
    #[serde(default)]
    pub item_status: Option<ItemStatus>,
    /// Case-insensitive substring over the descriptive payload fields
    /// (title, description, location, ride endpoints).
    #[serde(default)]
    pub query: Option<String>,
    /// Rows fetched per round trip; `0` means [`DEFAULT_PAGE_SIZE`].
    #[serde(default)]
    pub page_size: usize,
}

impl ListFilter {
    /// Filter for every open resource of `kind`.
    #[must_use]
    pub fn of_kind(kind: ResourceKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub(crate) fn effective_page_size(&self) -> usize {
        match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }

    /// Returns the trimmed query, or `None` if blank.
    pub(crate) fn query_text(&self) -> Option<&str> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|query| !query.is_empty())
    }
}

/// Keyset position in the newest-first listing order.
///
/// Opaque to callers; hand it back to [`OpenResources::resume`] to continue
/// after the last item that was yielded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCursor {
    pub(crate) created_at_ms: i64,
    pub(crate) resource_id: String,
}

impl ListCursor {
    fn after(resource: &Resource) -> Self {
        Self {
            created_at_ms: super::to_millis(resource.created_at),
            resource_id: resource.id.as_str().to_string(),
        }
    }
}

/// Iterator over open resources, fetched page by page.
///
/// The listing is evaluated against a fixed `now`, so resources that become
/// overdue during iteration are still excluded consistently. A fetch error
/// is yielded once and ends the iteration; [`Self::cursor`] still points at
/// the last good item so the caller can resume.
#[derive(Debug)]
pub struct OpenResources {
    store: Arc<dyn MarketStore>,
    filter: ListFilter,
    now: DateTime<Utc>,
    cursor: Option<ListCursor>,
    buffer: VecDeque<Resource>,
    exhausted: bool,
}

impl OpenResources {
    /// Starts a listing from the newest open resource.
    #[must_use]
    pub fn new(store: Arc<dyn MarketStore>, filter: ListFilter, now: DateTime<Utc>) -> Self {
        Self::resume(store, filter, None, now)
    }

    /// Continues a listing after `cursor`.
    #[must_use]
    pub fn resume(
        store: Arc<dyn MarketStore>,
        filter: ListFilter,
        cursor: Option<ListCursor>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            filter,
            now,
            cursor,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Position after the last yielded resource.
    #[must_use]
    pub const fn cursor(&self) -> Option<&ListCursor> {
        self.cursor.as_ref()
    }

    fn refill(&mut self) -> Result<(), StoreError> {
        let limit = self.filter.effective_page_size();
        let page = self
            .store
            .open_page(&self.filter, self.cursor.as_ref(), self.now, limit)?;
        if page.len() < limit {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for OpenResources {
    type Item = Result<Resource, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(err) = self.refill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        let resource = self.buffer.pop_front()?;
        self.cursor = Some(ListCursor::after(&resource));
        Some(Ok(resource))
    }
}
