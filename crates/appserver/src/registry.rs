//! # Id Registry
//!
//! Hands out `u16` ids for live connections and listeners.
//!
//! Ids come from a wrapping cursor that skips ids still in use, so an id can
//! be reused after its entry is removed but never while it is live. Claiming
//! goes through `DashMap`'s entry API, which makes "find a free id and take
//! it" a single step.

use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Every id is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

impl std::fmt::Display for Exhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no free ids")
    }
}

impl std::error::Error for Exhausted {}

pub struct Registry<T> {
    entries: DashMap<u16, T>,
    cursor: AtomicU16,
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            cursor: AtomicU16::new(1),
        }
    }

    /// Stores `value` under a free id and returns the id. `0` is never used.
    pub fn insert(&self, value: T) -> Result<u16, Exhausted> {
        for _ in 0..=u16::MAX as u32 {
            let id = self.cursor.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.entries.entry(id) {
                slot.insert(value);
                return Ok(id);
            }
        }
        Err(Exhausted)
    }

    pub fn get(&self, id: u16) -> Option<T> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: u16) -> Option<T> {
        self.entries.remove(&id).map(|(_, value)| value)
    }

    /// Removes the entry under `id` only if `pred` holds for it.
    pub fn remove_if(&self, id: u16, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        self.entries
            .remove_if(&id, |_, value| pred(value))
            .map(|(_, value)| value)
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<T> {
        let ids: Vec<u16> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
