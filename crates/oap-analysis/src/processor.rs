// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registry of rollup chains, one per indicator kind.

use crate::errors::{ConfigError, WorkerError};
use crate::indicator::{Function, Indicator};
use crate::rollup::RollupChain;
use crate::storage::model::Model;
use crate::storage::StorageGateway;
use crate::worker::WorkerConfig;
use hashbrown::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use tracing::{debug, error};
use ustr::Ustr;

type ChainMap = HashMap<Ustr, RollupChain, BuildHasherDefault<fnv::FnvHasher>>;

pub struct IndicatorProcessor {
    chains: ChainMap,
    /// Registration order, kept for deterministic flushes and model listings.
    order: Vec<Ustr>,
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct IndicatorProcessorBuilder {
    storage: Option<Arc<dyn StorageGateway>>,
    config: WorkerConfig,
    indicators: Vec<(String, Function)>,
}

impl IndicatorProcessorBuilder {
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StorageGateway>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn indicator(mut self, name: &str, function: Function) -> Self {
        self.indicators.push((name.to_string(), function));
        self
    }

    pub fn build(self) -> Result<IndicatorProcessor, ConfigError> {
        let storage = self.storage.ok_or(ConfigError::MissingStorage)?;
        let mut chains = ChainMap::default();
        let mut order = Vec::with_capacity(self.indicators.len());
        for (name, function) in self.indicators {
            let kind = Ustr::from(name.as_str());
            if chains.contains_key(&kind) {
                return Err(ConfigError::DuplicateIndicator(name));
            }
            chains.insert(
                kind,
                RollupChain::new(&name, function, Arc::clone(&storage), &self.config),
            );
            order.push(kind);
            debug!("Registered indicator {} ({})", name, function);
        }
        Ok(IndicatorProcessor { chains, order })
    }
}

impl IndicatorProcessor {
    pub fn builder() -> IndicatorProcessorBuilder {
        IndicatorProcessorBuilder::default()
    }

    pub fn chain(&self, kind: &str) -> Option<&RollupChain> {
        self.chains.get(&Ustr::from(kind))
    }

    /// Every model of every registered kind, in registration order.
    pub fn models(&self) -> Vec<Model> {
        self.chains_in_order()
            .flat_map(|chain| chain.models())
            .collect()
    }

    pub fn submit(&self, kind: &str, indicator: Indicator) -> Result<(), ConfigError> {
        let chain = self
            .chain(kind)
            .ok_or_else(|| ConfigError::UnknownIndicator(kind.to_string()))?;
        chain.submit(indicator);
        Ok(())
    }

    /// Flushes every chain. A failing chain does not prevent the others from
    /// flushing; the first error is returned.
    pub fn flush_all(&self) -> Result<(), WorkerError> {
        let mut first_error = None;
        for chain in self.chains_in_order() {
            if let Err(e) = chain.flush() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => {
                error!("Periodic persistence finished with errors");
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn chains_in_order(&self) -> impl Iterator<Item = &RollupChain> + '_ {
        self.order.iter().filter_map(|kind| self.chains.get(kind))
    }
}
