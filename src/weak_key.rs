//! Weakly-held table keys.
//!
//! A table entry must not keep its handle alive: the handle's lifetime is
//! bounded by the references application code holds, never by the maps that
//! have bound it. `WeakKey` therefore pairs the handle's identifier (usable
//! even after the handle is gone) with a `Weak` to the type-erased handle
//! state. Staleness is deterministic: the moment the last strong reference
//! drops, `is_stale` flips.

use std::sync::{Arc, Weak};

use crate::handle::HandleCore;

/// Shared, type-erased handle state as the table sees it.
pub(crate) type CoreRef = Arc<dyn HandleCore>;

pub(crate) struct WeakKey {
    id: u32,
    // `None` once cleared by an explicit removal.
    key: Option<Weak<dyn HandleCore>>,
}

impl WeakKey {
    pub(crate) fn new(core: &CoreRef) -> Self {
        Self {
            id: core.id(),
            key: Some(Arc::downgrade(core)),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Upgrade back to the handle state, if it is still live and uncleared.
    pub(crate) fn resolve(&self) -> Option<CoreRef> {
        self.key.as_ref().and_then(Weak::upgrade)
    }

    /// Drop the weak reference so lookups short-circuit immediately, without
    /// waiting for the last strong handle to go away.
    pub(crate) fn clear(&mut self) {
        self.key = None;
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.key
            .as_ref()
            .map_or(true, |weak| weak.strong_count() == 0)
    }

    /// Identity comparison against a live key. Identifiers are process-unique,
    /// so an identifier match on a live entry is a handle match.
    pub(crate) fn refers_to(&self, core: &CoreRef) -> bool {
        self.id == core.id() && !self.is_stale()
    }
}
