// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One time window's worth of merged indicators.
//!
//! The `writing` and `reading` states are advisory: they tell the flusher when
//! a slot is safe to drain and tell the swapper when the previous drain has not
//! finished yet. The map itself sits behind a mutex that only writers of the
//! same (current) slot ever contend on.

use crate::errors::IndicatorError;
use crate::indicator::{Indicator, IndicatorId};
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

type IndicatorMap = HashMap<IndicatorId, Indicator, BuildHasherDefault<fnv::FnvHasher>>;

pub struct MergeCollection {
    entries: Mutex<IndicatorMap>,
    size: AtomicUsize,
    writers: AtomicUsize,
    reading: AtomicBool,
}

/// Registration of one in-flight writer. The collection reports `writing`
/// until every guard handed out has been dropped.
#[must_use]
pub struct WritingGuard<'a> {
    collection: &'a MergeCollection,
}

impl Drop for WritingGuard<'_> {
    fn drop(&mut self) {
        self.collection.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MergeCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeCollection {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::with_hasher(BuildHasherDefault::default())),
            size: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
            reading: AtomicBool::new(false),
        }
    }

    /// Registers a writer. `SeqCst` pairs with the slot swap in
    /// `WindowedBuffer`: either the writer observes the swap and retries, or
    /// the drainer observes the writer and waits.
    pub fn writing(&self) -> WritingGuard<'_> {
        self.writers.fetch_add(1, Ordering::SeqCst);
        WritingGuard { collection: self }
    }

    pub fn is_writing(&self) -> bool {
        self.writers.load(Ordering::SeqCst) > 0
    }

    pub fn reading(&self) {
        self.reading.store(true, Ordering::Release);
    }

    pub fn finish_reading(&self) {
        self.reading.store(false, Ordering::Release);
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Number of distinct identities merged so far. Approximate while writers
    /// are active.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Merges `indicator` into the entry with the same identity, or inserts it.
    ///
    /// `calculate` runs after every merge so the derived value is always current.
    pub fn merge(
        &self,
        guard: &WritingGuard<'_>,
        mut indicator: Indicator,
    ) -> Result<(), IndicatorError> {
        debug_assert!(std::ptr::eq(guard.collection, self));
        let mut entries = self.lock();
        match entries.entry(indicator.id()) {
            Entry::Occupied(mut existing) => {
                let existing = existing.get_mut();
                existing.combine(&indicator)?;
                existing.calculate();
            }
            Entry::Vacant(slot) => {
                indicator.calculate();
                slot.insert(indicator);
                self.size.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &IndicatorId) -> Option<Indicator> {
        self.lock().get(id).cloned()
    }

    /// Moves every entry out, keeping the map's allocation for the next window.
    pub fn drain(&self) -> Vec<Indicator> {
        let mut entries = self.lock();
        let drained: Vec<Indicator> = entries.drain().map(|(_, indicator)| indicator).collect();
        self.size.store(0, Ordering::Relaxed);
        drained
    }

    fn lock(&self) -> MutexGuard<'_, IndicatorMap> {
        // A writer that panicked mid-merge leaves a map that is still structurally valid.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
