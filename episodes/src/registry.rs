//! This module provides the shared progress registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Progress registry of the downloads currently in progress.
///
/// A mapping from display keys to completion percentages behind a single mutex, shared by all workers and the renderer.
/// A key is present if and only if a download for it is in progress: entries are only created through [`Registry::track()`]
/// and removed when the returned [`Entry`] is dropped, whatever way the download ends.
///
/// The lock is only held to mutate or copy the map, never across network or disk I/O.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, u8>,
    /// High-water mark of simultaneously active entries.
    peak: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `key` at 0%.
    ///
    /// Returns `None` when `key` is already being tracked, since two downloads sharing a key would overwrite each other's progress.
    pub fn track(&self, key: &str) -> Option<Entry> {
        let mut state = self.lock();

        if state.entries.contains_key(key) {
            return None;
        }

        state.entries.insert(key.to_owned(), 0);
        state.peak = state.peak.max(state.entries.len());

        Some(Entry {
            registry: self.clone(),
            key: key.to_owned(),
            percent: 0,
        })
    }

    /// Copy the current entries, ordered by key.
    pub fn snapshot(&self) -> Vec<(String, u8)> {
        self.lock().entries.iter().map(|(key, &percent)| (key.clone(), percent)).collect()
    }

    pub fn get(&self, key: &str) -> Option<u8> {
        self.lock().entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// The highest number of entries that have ever been active at the same time.
    pub fn peak(&self) -> usize {
        self.lock().peak
    }

    // a panicking holder cannot leave the map half-updated, so a poisoned lock is still usable
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A tracked registry entry, removed from its [`Registry`] when dropped.
#[derive(Debug)]
pub struct Entry {
    registry: Registry,
    key: String,
    percent: u8,
}

impl Entry {
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last reported percentage.
    #[inline]
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Report `written` bytes out of `total`.
    ///
    /// Reported percentages never decrease; the registry is only locked when the value actually changes.
    pub fn update(&mut self, written: u64, total: u64) -> u8 {
        let percent = percent(written, total).max(self.percent);

        if percent != self.percent {
            self.percent = percent;

            if let Some(value) = self.registry.lock().entries.get_mut(&self.key) {
                *value = percent;
            }
        }

        percent
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.registry.lock().entries.remove(&self.key);
    }
}

/// Rounded completion percentage of `written` bytes out of `total`, bounded to `[0, 100]`.
///
/// An empty transfer is complete by convention.
pub fn percent(written: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }

    let written = u128::from(written.min(total));
    let total = u128::from(total);

    // round half up
    ((written * 200 + total) / (total * 2)) as u8
}
