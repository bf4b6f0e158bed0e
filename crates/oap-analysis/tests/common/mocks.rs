// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Storage gateways that wrap [`InMemoryStorage`] to inject failures or
//! observe the flushing worker.

use oap_analysis::errors::StorageError;
use oap_analysis::storage::memory::InMemoryStorage;
use oap_analysis::storage::model::Model;
use oap_analysis::storage::{BatchOperation, StorageGateway};
use oap_analysis::worker::{AggregationWorker, WorkerState};
use oap_analysis::{Indicator, IndicatorId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// Fails every lookup of one entity; everything else reaches the backing store.
pub struct FailingLookupStorage {
    pub inner: Arc<InMemoryStorage>,
    failing_entity: String,
    pub failed_lookups: AtomicUsize,
}

impl FailingLookupStorage {
    pub fn new(inner: Arc<InMemoryStorage>, failing_entity: &str) -> Self {
        Self {
            inner,
            failing_entity: failing_entity.to_string(),
            failed_lookups: AtomicUsize::new(0),
        }
    }
}

impl StorageGateway for FailingLookupStorage {
    fn get(&self, model: &Model, id: &IndicatorId) -> Result<Option<Indicator>, StorageError> {
        if id.entity_id.as_str() == self.failing_entity {
            self.failed_lookups.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Lookup {
                table: model.table_name(),
                id: id.to_string(),
                reason: "connection reset by peer".to_string(),
            });
        }
        self.inner.get(model, id)
    }

    fn persist_batch(&self, batch: Vec<BatchOperation>) -> Result<(), StorageError> {
        self.inner.persist_batch(batch)
    }
}

/// Records the state of a watched worker at every batch write.
#[derive(Default)]
pub struct StateRecordingStorage {
    pub inner: Arc<InMemoryStorage>,
    watched: OnceLock<Weak<AggregationWorker>>,
    pub observed: Mutex<Vec<WorkerState>>,
}

impl StateRecordingStorage {
    pub fn watch(&self, worker: &Arc<AggregationWorker>) {
        let _ = self.watched.set(Arc::downgrade(worker));
    }
}

impl StorageGateway for StateRecordingStorage {
    fn get(&self, model: &Model, id: &IndicatorId) -> Result<Option<Indicator>, StorageError> {
        self.inner.get(model, id)
    }

    fn persist_batch(&self, batch: Vec<BatchOperation>) -> Result<(), StorageError> {
        if let Some(worker) = self.watched.get().and_then(Weak::upgrade) {
            if let Ok(mut observed) = self.observed.lock() {
                observed.push(worker.state());
            }
        }
        self.inner.persist_batch(batch)
    }
}
