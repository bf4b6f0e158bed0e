// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the aggregation integration tests.

pub mod mocks;

use oap_analysis::rollup::RollupChain;
use oap_analysis::storage::memory::InMemoryStorage;
use oap_analysis::storage::model::{Model, ModelInstaller};
use oap_analysis::storage::StorageGateway;
use oap_analysis::worker::WorkerConfig;
use oap_analysis::Function;
use std::sync::Arc;

pub const MINUTE: i64 = 202403151427;
pub const HOUR: i64 = 2024031514;

/// A count chain over `gateway`, with every level's table installed in `backing`.
pub fn count_chain(
    name: &str,
    backing: &InMemoryStorage,
    gateway: Arc<dyn StorageGateway>,
    batch_size: usize,
) -> RollupChain {
    let chain = RollupChain::new(
        name,
        Function::Count,
        gateway,
        &WorkerConfig {
            batch_size,
            ..Default::default()
        },
    );
    let models: Vec<Model> = chain.models().collect();
    backing
        .install(&models, false)
        .unwrap_or_else(|e| panic!("install failed: {e}"));
    chain
}

/// `(entity, value)` pairs stored for `model`, sorted by entity.
pub fn stored_values(storage: &InMemoryStorage, model: &Model) -> Vec<(String, i64)> {
    let mut values: Vec<(String, i64)> = storage
        .indicators(model)
        .unwrap_or_else(|e| panic!("read failed: {e}"))
        .into_iter()
        .map(|i| (i.entity_id.to_string(), i.value()))
        .collect();
    values.sort();
    values
}
