// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Storage models: which table an indicator kind lives in at each granularity,
//! its column layout, and the row codec.

use crate::errors::StorageError;
use crate::indicator::{Function, Indicator};
use crate::time_bucket::Downsampling;
use derive_more::Display;
use serde_json::{Map, Value};
use tracing::info;
use ustr::Ustr;

/// A storage row, keyed by column name.
pub type Row = Map<String, Value>;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    #[display("keyword")]
    Keyword,
    #[display("long")]
    Long,
    #[display("integer")]
    Integer,
    #[display("text")]
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelColumn {
    pub name: &'static str,
    pub column_type: ColumnType,
}

const fn column(name: &'static str, column_type: ColumnType) -> ModelColumn {
    ModelColumn { name, column_type }
}

const COMMON_COLUMNS: [ModelColumn; 3] = [
    column("entity_id", ColumnType::Keyword),
    column("time_bucket", ColumnType::Long),
    column("function", ColumnType::Keyword),
];

const COUNT_COLUMNS: [ModelColumn; 1] = [column("value", ColumnType::Long)];

const LONG_AVG_COLUMNS: [ModelColumn; 3] = [
    column("summation", ColumnType::Long),
    column("count", ColumnType::Long),
    column("value", ColumnType::Long),
];

const PERCENT_COLUMNS: [ModelColumn; 3] = [
    column("total", ColumnType::Long),
    column("match", ColumnType::Long),
    column("percentage", ColumnType::Integer),
];

const PERCENTILE_COLUMNS: [ModelColumn; 4] = [
    column("precision", ColumnType::Integer),
    column("rank", ColumnType::Integer),
    column("detail", ColumnType::Text),
    column("value", ColumnType::Integer),
];

/// One indicator kind at one granularity.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{name}@{downsampling}")]
pub struct Model {
    pub name: Ustr,
    pub function: Function,
    pub downsampling: Downsampling,
}

impl Model {
    pub fn new(name: &str, function: Function, downsampling: Downsampling) -> Self {
        Self {
            name: Ustr::from(name),
            function,
            downsampling,
        }
    }

    /// `service_p50` at minute level, `service_p50_hour` and so on above it.
    pub fn table_name(&self) -> String {
        match self.downsampling.table_suffix() {
            Some(suffix) => format!("{}_{}", self.name, suffix),
            None => self.name.to_string(),
        }
    }

    /// The same kind at the next coarser granularity.
    pub fn coarser(&self) -> Option<Model> {
        self.downsampling.coarser().map(|downsampling| Model {
            downsampling,
            ..*self
        })
    }

    pub fn columns(&self) -> Vec<ModelColumn> {
        let value_columns: &[ModelColumn] = match self.function {
            Function::Count => &COUNT_COLUMNS,
            Function::LongAvg => &LONG_AVG_COLUMNS,
            Function::Percent => &PERCENT_COLUMNS,
            Function::Percentile => &PERCENTILE_COLUMNS,
        };
        COMMON_COLUMNS
            .iter()
            .chain(value_columns)
            .copied()
            .collect()
    }

    pub fn to_row(&self, indicator: &Indicator) -> Result<Row, StorageError> {
        self.check_function(indicator)?;
        match serde_json::to_value(indicator)? {
            Value::Object(row) => Ok(row),
            other => Err(StorageError::Prepare {
                table: self.table_name(),
                id: indicator.id().to_string(),
                reason: format!("expected an object row, got {other}"),
            }),
        }
    }

    pub fn from_row(&self, row: Row) -> Result<Indicator, StorageError> {
        let indicator: Indicator = serde_json::from_value(Value::Object(row))?;
        self.check_function(&indicator)?;
        Ok(indicator)
    }

    fn check_function(&self, indicator: &Indicator) -> Result<(), StorageError> {
        if indicator.function() == self.function {
            return Ok(());
        }
        Err(StorageError::Prepare {
            table: self.table_name(),
            id: indicator.id().to_string(),
            reason: format!(
                "{} value does not fit a {} model",
                indicator.function(),
                self.function
            ),
        })
    }
}

/// Creates and verifies the tables backing a set of models.
pub trait ModelInstaller {
    fn is_exists(&self, model: &Model) -> Result<bool, StorageError>;

    fn create_table(&self, model: &Model) -> Result<(), StorageError>;

    fn delete_table(&self, model: &Model) -> Result<(), StorageError>;

    fn column_check(&self, model: &Model) -> Result<(), StorageError>;

    /// Creates missing tables. With `recreate`, existing tables are dropped and
    /// created again; every table's columns are checked afterwards.
    fn install(&self, models: &[Model], recreate: bool) -> Result<(), StorageError> {
        for model in models {
            if !self.is_exists(model)? {
                info!("table: {} not exists", model.table_name());
                self.create_table(model)?;
            } else if recreate {
                info!("table: {} exists, recreating", model.table_name());
                self.delete_table(model)?;
                self.create_table(model)?;
            }
            self.column_check(model)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_follow_granularity() {
        let model = Model::new("service_p50", Function::Percentile, Downsampling::Minute);
        assert_eq!(model.table_name(), "service_p50");
        let names: Vec<String> = std::iter::successors(Some(model), Model::coarser)
            .map(|m| m.table_name())
            .collect();
        assert_eq!(
            names,
            vec![
                "service_p50",
                "service_p50_hour",
                "service_p50_day",
                "service_p50_month"
            ]
        );
    }

    #[test]
    fn test_columns_by_function() {
        let model = Model::new("service_sla", Function::Percent, Downsampling::Day);
        let names: Vec<&str> = model.columns().iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            vec!["entity_id", "time_bucket", "function", "total", "match", "percentage"]
        );
    }

    #[test]
    fn test_row_codec() {
        let model = Model::new("service_p50", Function::Percentile, Downsampling::Minute);
        let mut indicator = Indicator::percentile("svc", 202403151427, 130, 10, 50);
        indicator.calculate();

        let row = model.to_row(&indicator).unwrap();
        for column in model.columns() {
            assert!(row.contains_key(column.name), "missing {}", column.name);
        }
        let back = model.from_row(row).unwrap();
        assert_eq!(back.value, indicator.value);
        assert_eq!(back.value(), 130);
    }

    #[test]
    fn test_row_codec_rejects_other_function() {
        let model = Model::new("service_cpm", Function::Count, Downsampling::Minute);
        let err = model
            .to_row(&Indicator::percent("svc", 202403151427, true))
            .unwrap_err();
        assert!(err.to_string().contains("percent value does not fit a count model"));
    }
}
