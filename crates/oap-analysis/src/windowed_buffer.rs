// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Double-buffered merge cache.
//!
//! Two [`MergeCollection`] slots alternate between "current" (receiving
//! writes) and "last" (being drained by the single flusher). Writers never
//! take a buffer-wide lock: they register on the slot they believe is current
//! and re-check the index, so a writer racing a swap either lands in the new
//! slot or is waited for by `drain_last`.

use crate::errors::IndicatorError;
use crate::indicator::Indicator;
use crate::merge_collection::MergeCollection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::trace;

/// Spins before `drain_last` starts sleeping between polls.
const DRAIN_SPIN_LIMIT: u32 = 64;

/// Poll schedule used by `drain_last` while a writer is still finishing a
/// merge on the retired slot. Writers hold the slot for a single merge, so
/// the wait is short; the sleep doubles from `initial` up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for DrainBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_micros(10),
            max: Duration::from_millis(10),
        }
    }
}

pub struct WindowedBuffer {
    slots: [MergeCollection; 2],
    current: AtomicUsize,
    swap_claims: AtomicUsize,
    backoff: DrainBackoff,
}

/// Outcome of [`WindowedBuffer::try_begin_swap`]. The claim is released when
/// the attempt is dropped, whether or not it was granted.
#[must_use]
pub struct SwapAttempt<'a> {
    buffer: &'a WindowedBuffer,
    claimed: bool,
    committed: bool,
}

impl SwapAttempt<'_> {
    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    /// Exchanges the slots. Returns `false` without swapping when the claim
    /// was not granted or this attempt already committed.
    pub fn commit(&mut self) -> bool {
        if !self.claimed || self.committed {
            return false;
        }
        self.buffer.commit_swap();
        self.committed = true;
        true
    }
}

impl Drop for SwapAttempt<'_> {
    fn drop(&mut self) {
        self.buffer.swap_claims.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for WindowedBuffer {
    fn default() -> Self {
        Self::new(DrainBackoff::default())
    }
}

impl WindowedBuffer {
    pub fn new(backoff: DrainBackoff) -> Self {
        Self {
            slots: [MergeCollection::new(), MergeCollection::new()],
            current: AtomicUsize::new(0),
            swap_claims: AtomicUsize::new(0),
            backoff,
        }
    }

    pub fn current(&self) -> &MergeCollection {
        &self.slots[self.current.load(Ordering::SeqCst)]
    }

    pub fn last(&self) -> &MergeCollection {
        &self.slots[1 - self.current.load(Ordering::SeqCst)]
    }

    /// Heuristic size of the active slot, used to trigger flushes.
    pub fn current_size(&self) -> usize {
        self.current().size()
    }

    /// Claims the right to swap. Only granted when no other attempt is in
    /// flight and the previous "last" slot has been fully drained.
    ///
    /// Unclaimed attempts count as in flight too: while one is alive every
    /// new attempt is refused, even if no swap is running. A flush that loses
    /// this race is skipped and its data waits for the next one.
    pub fn try_begin_swap(&self) -> SwapAttempt<'_> {
        let in_flight = self.swap_claims.fetch_add(1, Ordering::AcqRel);
        let claimed = in_flight == 0 && !self.last().is_reading();
        SwapAttempt {
            buffer: self,
            claimed,
            committed: false,
        }
    }

    fn commit_swap(&self) {
        let retired = self.current.load(Ordering::SeqCst);
        self.current.store(1 - retired, Ordering::SeqCst);
        self.slots[retired].reading();
        trace!("Swapped merge slots, slot {} retired", retired);
    }

    /// Writer path: merges `indicator` into whichever slot is current when
    /// the writer registers.
    pub fn merge(&self, indicator: Indicator) -> Result<(), IndicatorError> {
        loop {
            let index = self.current.load(Ordering::SeqCst);
            let slot = &self.slots[index];
            let guard = slot.writing();
            if self.current.load(Ordering::SeqCst) != index {
                // Swapped between the load and the registration; the retired
                // slot may already be draining.
                drop(guard);
                continue;
            }
            return slot.merge(&guard, indicator);
        }
    }

    /// Takes every entry out of the "last" slot once its in-flight writers
    /// are done, then releases the slot for the next swap.
    pub fn drain_last(&self) -> Vec<Indicator> {
        let last = self.last();
        let mut spins = 0;
        let mut delay = self.backoff.initial;
        while last.is_writing() {
            if spins < DRAIN_SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::sleep(delay);
                delay = (delay * 2).min(self.backoff.max);
            }
        }

        last.reading();
        let drained = last.drain();
        last.finish_reading();
        drained
    }
}
