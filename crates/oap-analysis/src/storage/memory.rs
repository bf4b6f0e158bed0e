// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-local storage backend. Tables must be installed before use.

use super::model::{Model, ModelInstaller, Row};
use super::{BatchOperation, StorageGateway};
use crate::errors::StorageError;
use crate::indicator::{Indicator, IndicatorId};
use hashbrown::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

type FnvMap<K, V> = HashMap<K, V, BuildHasherDefault<fnv::FnvHasher>>;

struct Table {
    columns: Vec<&'static str>,
    rows: FnvMap<String, Row>,
}

#[derive(Default)]
pub struct InMemoryStorage {
    tables: RwLock<FnvMap<String, Table>>,
    batches: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches persisted so far.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Row> {
        self.read()
            .get(table)
            .and_then(|t| t.rows.get(id))
            .cloned()
    }

    /// Every indicator stored for `model`, in no particular order.
    pub fn indicators(&self, model: &Model) -> Result<Vec<Indicator>, StorageError> {
        let tables = self.read();
        let table = tables
            .get(&model.table_name())
            .ok_or_else(|| StorageError::TableMissing(model.table_name()))?;
        table
            .rows
            .values()
            .map(|row| model.from_row(row.clone()))
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, FnvMap<String, Table>> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FnvMap<String, Table>> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageGateway for InMemoryStorage {
    fn get(&self, model: &Model, id: &IndicatorId) -> Result<Option<Indicator>, StorageError> {
        let tables = self.read();
        let table = tables
            .get(&model.table_name())
            .ok_or_else(|| StorageError::TableMissing(model.table_name()))?;
        table
            .rows
            .get(&id.to_string())
            .map(|row| model.from_row(row.clone()))
            .transpose()
    }

    fn persist_batch(&self, batch: Vec<BatchOperation>) -> Result<(), StorageError> {
        let mut tables = self.write();
        // All or nothing: reject the batch before touching any table.
        if let Some(missing) = batch
            .iter()
            .map(|op| &op.prepared().table)
            .find(|table| !tables.contains_key(*table))
        {
            return Err(StorageError::TableMissing(missing.clone()));
        }

        let operations = batch.len();
        for operation in batch {
            let (BatchOperation::Insert(prepared) | BatchOperation::Update(prepared)) = operation;
            if let Some(table) = tables.get_mut(&prepared.table) {
                table.rows.insert(prepared.id, prepared.row);
            }
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        debug!("Persisted batch of {} operations", operations);
        Ok(())
    }
}

impl ModelInstaller for InMemoryStorage {
    fn is_exists(&self, model: &Model) -> Result<bool, StorageError> {
        Ok(self.read().contains_key(&model.table_name()))
    }

    fn create_table(&self, model: &Model) -> Result<(), StorageError> {
        let columns = model.columns().iter().map(|c| c.name).collect();
        self.write().insert(
            model.table_name(),
            Table {
                columns,
                rows: FnvMap::default(),
            },
        );
        Ok(())
    }

    fn delete_table(&self, model: &Model) -> Result<(), StorageError> {
        self.write().remove(&model.table_name());
        Ok(())
    }

    fn column_check(&self, model: &Model) -> Result<(), StorageError> {
        let tables = self.read();
        let table = tables
            .get(&model.table_name())
            .ok_or_else(|| StorageError::TableMissing(model.table_name()))?;
        match model
            .columns()
            .iter()
            .find(|c| !table.columns.contains(&c.name))
        {
            Some(column) => Err(StorageError::ColumnMissing {
                table: model.table_name(),
                column: column.name.to_string(),
            }),
            None => Ok(()),
        }
    }
}
