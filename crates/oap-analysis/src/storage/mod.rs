// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contracts between the aggregation workers and a storage backend.

pub mod memory;
pub mod model;

use crate::errors::StorageError;
use crate::indicator::{Indicator, IndicatorId};
use model::{Model, Row};

/// A row ready to be written, produced by `prepare_insert`/`prepare_update`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRow {
    pub table: String,
    pub id: String,
    pub row: Row,
}

impl PreparedRow {
    pub fn new(model: &Model, indicator: &Indicator) -> Result<Self, StorageError> {
        Ok(Self {
            table: model.table_name(),
            id: indicator.id().to_string(),
            row: model.to_row(indicator)?,
        })
    }
}

/// One operation of a persistence batch. Opaque to the workers.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    Insert(PreparedRow),
    Update(PreparedRow),
}

impl BatchOperation {
    pub fn prepared(&self) -> &PreparedRow {
        match self {
            BatchOperation::Insert(row) | BatchOperation::Update(row) => row,
        }
    }

    pub fn is_update(&self) -> bool {
        matches!(self, BatchOperation::Update(_))
    }
}

/// Lookup and batch-write access to persisted indicators.
///
/// Implementations are shared by every worker thread. Retry and timeout policy
/// for `persist_batch` belongs to the implementation.
pub trait StorageGateway: Send + Sync {
    fn get(&self, model: &Model, id: &IndicatorId) -> Result<Option<Indicator>, StorageError>;

    fn prepare_insert(
        &self,
        model: &Model,
        indicator: &Indicator,
    ) -> Result<BatchOperation, StorageError> {
        Ok(BatchOperation::Insert(PreparedRow::new(model, indicator)?))
    }

    fn prepare_update(
        &self,
        model: &Model,
        indicator: &Indicator,
    ) -> Result<BatchOperation, StorageError> {
        Ok(BatchOperation::Update(PreparedRow::new(model, indicator)?))
    }

    fn persist_batch(&self, batch: Vec<BatchOperation>) -> Result<(), StorageError>;
}
