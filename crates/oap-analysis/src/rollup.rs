// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minute → hour → day → month worker chain for one indicator kind.

use crate::errors::WorkerError;
use crate::indicator::{Function, Indicator};
use crate::storage::model::Model;
use crate::storage::StorageGateway;
use crate::time_bucket::Downsampling;
use crate::worker::{AggregationWorker, WorkerConfig};
use std::sync::Arc;
use tracing::error;

pub struct RollupChain {
    /// Ordered finest first.
    workers: Vec<Arc<AggregationWorker>>,
}

impl RollupChain {
    /// Builds the chain coarsest first so each worker receives its successor
    /// at construction.
    pub fn new(
        name: &str,
        function: Function,
        storage: Arc<dyn StorageGateway>,
        config: &WorkerConfig,
    ) -> Self {
        let mut workers: Vec<Arc<AggregationWorker>> =
            Vec::with_capacity(Downsampling::ALL.len());
        for downsampling in Downsampling::ALL.into_iter().rev() {
            let next = workers.last().cloned();
            workers.push(Arc::new(AggregationWorker::new(
                Model::new(name, function, downsampling),
                Arc::clone(&storage),
                next,
                config,
            )));
        }
        workers.reverse();
        Self { workers }
    }

    /// The minute-level worker; the entry point for raw updates.
    pub fn head(&self) -> &Arc<AggregationWorker> {
        &self.workers[0]
    }

    pub fn worker(&self, downsampling: Downsampling) -> Option<&Arc<AggregationWorker>> {
        self.workers
            .iter()
            .find(|w| w.model().downsampling == downsampling)
    }

    pub fn models(&self) -> impl Iterator<Item = Model> + '_ {
        self.workers.iter().map(|w| *w.model())
    }

    pub fn submit(&self, indicator: Indicator) {
        self.head().submit(indicator);
    }

    /// Flushes every level, finest first, so entries forwarded by one level
    /// are persisted by the next in the same pass. A failing level does not
    /// stop the coarser ones; the first error is returned.
    pub fn flush(&self) -> Result<(), WorkerError> {
        let mut first_error = None;
        for worker in &self.workers {
            if let Err(e) = worker.flush_and_swap() {
                error!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
