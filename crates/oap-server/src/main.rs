// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::io::BufRead;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use oap_analysis::{
    cluster::{owner_of, ClusterRegistry, InMemoryCoordinator, RemoteInstance},
    config::AnalysisConfig,
    processor::IndicatorProcessor,
    source::{SourceDispatcher, SpanHandle, SpanSummary, ALL_ENTITY},
    storage::{memory::InMemoryStorage, model::ModelInstaller, StorageGateway},
    timer::PersistenceTimer,
    Indicator,
};

#[tokio::main]
pub async fn main() {
    let config = match AnalysisConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error reading configuration: {e}");
            return;
        }
    };

    let env_filter = format!("tokio=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let storage = Arc::new(InMemoryStorage::new());
    let processor = match SourceDispatcher::register(
        IndicatorProcessor::builder()
            .storage(Arc::clone(&storage) as Arc<dyn StorageGateway>)
            .worker_config(config.worker_config()),
    )
    .build()
    {
        Ok(processor) => Arc::new(processor),
        Err(e) => {
            error!("Error building indicator processor: {e}");
            return;
        }
    };

    if let Err(e) = storage.install(&processor.models(), false) {
        error!("Error installing storage models: {e}");
        return;
    }

    let dispatcher = match SourceDispatcher::new(Arc::clone(&processor)) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("Error creating source dispatcher: {e}");
            return;
        }
    };

    let coordinator = InMemoryCoordinator::new();
    if let Err(e) = coordinator.register_remote(RemoteInstance::new(&config.host, config.port)) {
        error!("Error registering with the cluster: {e}");
        return;
    }
    match coordinator.query_remote_nodes() {
        Ok(nodes) => {
            info!("Cluster has {} analysis instance(s)", nodes.len());
            let global = Indicator::count(ALL_ENTITY, 0, 0);
            if let Some(owner) = owner_of(&nodes, &global) {
                info!("Global scope indicators are owned by {owner}");
            }
        }
        Err(e) => error!("Error querying cluster members: {e}"),
    }

    let intake_token = CancellationToken::new();
    let (span_service, span_handle) = dispatcher.into_service();
    let span_task = tokio::spawn(span_service.run(intake_token.clone()));
    read_spans_from_stdin(span_handle);

    let cancel_token = CancellationToken::new();
    let timer = PersistenceTimer::new(Arc::clone(&processor), config.persistent_period())
        .spawn(cancel_token.clone());
    info!(
        "oap-server: aggregating {} models, persisting every {}s",
        processor.models().len(),
        config.persistent_period_secs
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error waiting for shutdown signal: {e}");
    }
    info!("Shutting down, flushing pending indicators");
    intake_token.cancel();
    if let Err(e) = span_task.await {
        error!("Span service ended abnormally: {e}");
    }
    cancel_token.cancel();
    if let Err(e) = timer.await {
        error!("Persistence timer ended abnormally: {e}");
    }
}

/// Feeds newline-delimited JSON spans from stdin to the span service. Runs on
/// a plain thread; shutdown does not wait for it.
fn read_spans_from_stdin(handle: SpanHandle) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("Error reading spans from stdin: {e}");
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SpanSummary>(&line) {
                Ok(span) => {
                    if handle.send(span).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Skipping malformed span: {e}"),
            }
        }
        debug!("Span input closed");
    });
}
