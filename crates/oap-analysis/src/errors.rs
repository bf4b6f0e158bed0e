// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the aggregation engine.

use crate::time_bucket::Downsampling;

/// Errors raised while merging or projecting a single indicator.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IndicatorError {
    #[error("cannot combine a {incoming} value into a {existing} indicator")]
    FunctionMismatch {
        existing: &'static str,
        incoming: &'static str,
    },

    #[error("cannot combine percentile indicators with different shapes: {0}")]
    ShapeMismatch(String),

    #[error("cannot combine {existing} with {incoming}: identities differ")]
    IdentityMismatch { existing: String, incoming: String },

    #[error(transparent)]
    TimeBucket(#[from] TimeBucketError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimeBucketError {
    #[error("time bucket {0} does not match any known granularity")]
    UnknownGranularity(i64),

    #[error("cannot widen time bucket {bucket} from {from} to finer granularity {to}")]
    NotCoarser {
        bucket: i64,
        from: Downsampling,
        to: Downsampling,
    },

    #[error("timestamp {0}ms is out of range")]
    TimestampOutOfRange(i64),
}

/// Errors reported by a storage gateway.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to look up {id} in {table}: {reason}")]
    Lookup {
        table: String,
        id: String,
        reason: String,
    },

    #[error("failed to prepare {id} for {table}: {reason}")]
    Prepare {
        table: String,
        id: String,
        reason: String,
    },

    #[error("batch persistence of {operations} operations failed: {reason}")]
    Persist { operations: usize, reason: String },

    #[error("table {0} does not exist")]
    TableMissing(String),

    #[error("table {table} is missing column {column}")]
    ColumnMissing { table: String, column: String },

    #[error("row codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors surfaced by an aggregation worker's flush cycle.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("flush of {model} failed: {source}")]
    Persist {
        model: String,
        #[source]
        source: StorageError,
    },
}

/// Startup and configuration errors. These are fatal.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("no storage gateway configured")]
    MissingStorage,

    #[error("indicator {0} is registered twice")]
    DuplicateIndicator(String),

    #[error("indicator {0} is not registered")]
    UnknownIndicator(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("failed to register remote instance {address}: {reason}")]
    Register { address: String, reason: String },

    #[error("no instance registered as self")]
    NotRegistered,
}
