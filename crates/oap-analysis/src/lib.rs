// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming indicator aggregation.
//!
//! Raw updates enter a [`rollup::RollupChain`] at minute granularity. Each
//! level is an [`worker::AggregationWorker`] that merges updates into a
//! double-buffered window, periodically reconciles the retired window with
//! storage through a [`storage::StorageGateway`], and forwards every flushed
//! entry to the next coarser level (hour, day, month).

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod cluster;
pub mod config;
pub mod errors;
pub mod indicator;
pub mod merge_collection;
pub mod processor;
pub mod rollup;
pub mod source;
pub mod storage;
pub mod time_bucket;
pub mod timer;
pub mod windowed_buffer;
pub mod worker;

pub use config::AnalysisConfig;
pub use indicator::{Function, Indicator, IndicatorId, IndicatorValue};
pub use processor::IndicatorProcessor;
pub use rollup::RollupChain;
pub use worker::{AggregationWorker, WorkerConfig};
