// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation worker: merges indicator updates into a windowed buffer,
//! flushes the retired window to storage and forwards every flushed entry to
//! the next coarser granularity.
//!
//! # Flush cadence
//!
//! There is no background thread. Before merging an update, `submit` checks the
//! size of the active window; once it reaches `batch_size` the submitting
//! thread tries to swap and flush inline. The update that triggered the flush
//! is merged afterwards, into the fresh window. `flush_and_swap` runs the same
//! cycle on demand (periodic persistence, shutdown).
//!
//! # Failure handling
//!
//! A failed lookup, combine or prepare for one identity drops that identity
//! from the batch and is logged; the rest of the batch proceeds. A failed
//! batch write is returned by `flush_and_swap` and only logged by `submit`.

use crate::errors::WorkerError;
use crate::indicator::Indicator;
use crate::storage::model::Model;
use crate::storage::{BatchOperation, StorageGateway};
use crate::windowed_buffer::{DrainBackoff, WindowedBuffer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const DEFAULT_BATCH_SIZE: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Active window size (distinct identities) that triggers an inline flush.
    pub batch_size: usize,
    pub drain_backoff: DrainBackoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            drain_backoff: DrainBackoff::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Accepting,
    Flushing,
}

#[derive(Debug, Default)]
struct WorkerStats {
    merged: AtomicU64,
    merge_failures: AtomicU64,
    flushes: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    reconcile_failures: AtomicU64,
    forwarded: AtomicU64,
    forward_failures: AtomicU64,
    persist_failures: AtomicU64,
}

/// Point-in-time copy of a worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub merged: u64,
    pub merge_failures: u64,
    pub flushes: u64,
    pub inserts: u64,
    pub updates: u64,
    pub reconcile_failures: u64,
    pub forwarded: u64,
    pub forward_failures: u64,
    pub persist_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Marks the worker as flushing for the lifetime of the guard.
struct FlushingGuard<'a>(&'a AtomicBool);

impl<'a> FlushingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for FlushingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct AggregationWorker {
    model: Model,
    buffer: WindowedBuffer,
    batch_size: usize,
    storage: Arc<dyn StorageGateway>,
    next: Option<Arc<AggregationWorker>>,
    flushing: AtomicBool,
    stats: WorkerStats,
}

impl AggregationWorker {
    /// `next` receives every flushed indicator, re-keyed to its granularity.
    pub fn new(
        model: Model,
        storage: Arc<dyn StorageGateway>,
        next: Option<Arc<AggregationWorker>>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            model,
            buffer: WindowedBuffer::new(config.drain_backoff),
            batch_size: config.batch_size.max(1),
            storage,
            next,
            flushing: AtomicBool::new(false),
            stats: WorkerStats::default(),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn next(&self) -> Option<&Arc<AggregationWorker>> {
        self.next.as_ref()
    }

    pub fn buffer(&self) -> &WindowedBuffer {
        &self.buffer
    }

    pub fn state(&self) -> WorkerState {
        if self.flushing.load(Ordering::Acquire) {
            WorkerState::Flushing
        } else {
            WorkerState::Accepting
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        WorkerStatsSnapshot {
            merged: load(&self.stats.merged),
            merge_failures: load(&self.stats.merge_failures),
            flushes: load(&self.stats.flushes),
            inserts: load(&self.stats.inserts),
            updates: load(&self.stats.updates),
            reconcile_failures: load(&self.stats.reconcile_failures),
            forwarded: load(&self.stats.forwarded),
            forward_failures: load(&self.stats.forward_failures),
            persist_failures: load(&self.stats.persist_failures),
        }
    }

    /// Merges one update. Never fails: merge and persistence problems are
    /// logged and counted.
    pub fn submit(&self, indicator: Indicator) {
        if self.buffer.current_size() >= self.batch_size {
            if let Err(e) = self.flush_and_swap() {
                error!("{}", e);
            }
        }

        let id = indicator.id();
        match self.buffer.merge(indicator) {
            Ok(()) => bump(&self.stats.merged),
            Err(e) => {
                bump(&self.stats.merge_failures);
                warn!("{}: dropping update for {}: {}", self.model, id, e);
            }
        }
    }

    /// Swaps the windows and flushes the retired one. Returns `Ok(false)`
    /// when another thread holds the swap claim; that thread flushes instead.
    pub fn flush_and_swap(&self) -> Result<bool, WorkerError> {
        let mut attempt = self.buffer.try_begin_swap();
        if !attempt.commit() {
            return Ok(false);
        }
        let _flushing = FlushingGuard::enter(&self.flushing);
        self.flush_last()?;
        Ok(true)
    }

    fn flush_last(&self) -> Result<(), WorkerError> {
        let drained = self.buffer.drain_last();
        if drained.is_empty() {
            return Ok(());
        }

        let batch = self.prepare_batch(drained);
        if batch.is_empty() {
            return Ok(());
        }
        let updates = batch.iter().filter(|op| op.is_update()).count() as u64;
        let inserts = batch.len() as u64 - updates;

        if let Err(source) = self.storage.persist_batch(batch) {
            bump(&self.stats.persist_failures);
            return Err(WorkerError::Persist {
                model: self.model.to_string(),
                source,
            });
        }

        bump(&self.stats.flushes);
        self.stats.inserts.fetch_add(inserts, Ordering::Relaxed);
        self.stats.updates.fetch_add(updates, Ordering::Relaxed);
        debug!(
            "{}: persisted {} inserts and {} updates",
            self.model, inserts, updates
        );
        Ok(())
    }

    fn prepare_batch(&self, drained: Vec<Indicator>) -> Vec<BatchOperation> {
        let mut batch = Vec::with_capacity(drained.len());
        for indicator in drained {
            let Some((operation, reconciled)) = self.reconcile(indicator) else {
                bump(&self.stats.reconcile_failures);
                continue;
            };
            batch.push(operation);
            self.forward(&reconciled);
        }
        batch
    }

    /// Folds the persisted value of the same identity into `indicator` and
    /// prepares the matching write.
    fn reconcile(&self, mut indicator: Indicator) -> Option<(BatchOperation, Indicator)> {
        let id = indicator.id();
        let persisted = match self.storage.get(&self.model, &id) {
            Ok(persisted) => persisted,
            Err(e) => {
                error!("{}: failed to look up {}: {}", self.model, id, e);
                return None;
            }
        };

        let operation = match persisted {
            Some(persisted) => {
                if let Err(e) = indicator.combine(&persisted) {
                    error!("{}: failed to combine {}: {}", self.model, id, e);
                    return None;
                }
                indicator.calculate();
                self.storage.prepare_update(&self.model, &indicator)
            }
            None => self.storage.prepare_insert(&self.model, &indicator),
        };

        match operation {
            Ok(operation) => Some((operation, indicator)),
            Err(e) => {
                error!("{}: failed to prepare {}: {}", self.model, id, e);
                None
            }
        }
    }

    fn forward(&self, indicator: &Indicator) {
        let Some(next) = &self.next else {
            return;
        };
        match indicator.rollup(next.model.downsampling) {
            Ok(rolled) => {
                bump(&self.stats.forwarded);
                next.submit(rolled);
            }
            Err(e) => {
                bump(&self.stats.forward_failures);
                error!(
                    "{}: failed to forward {} to {}: {}",
                    self.model,
                    indicator.id(),
                    next.model,
                    e
                );
            }
        }
    }
}
