//! Default handler for adding missing columns
//!
//! Columns named in the configuration that a batch lacks are appended,
//! filled with a constant. Columns already present are left untouched.

use std::collections::HashSet;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::RecordBatchHandler;
use crate::error::{Error, Result};
use crate::metadata::{with_column_type, ColumnType};

/// Constant used to fill a missing column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    String(String),
}

impl DefaultValue {
    pub fn data_type(&self) -> DataType {
        match self {
            DefaultValue::Boolean(_) => DataType::Boolean,
            DefaultValue::Int64(_) => DataType::Int64,
            DefaultValue::Float64(_) => DataType::Float64,
            DefaultValue::String(_) => DataType::Utf8,
        }
    }

    /// Array of `len` copies of this value
    fn to_array(&self, len: usize) -> ArrayRef {
        match self {
            DefaultValue::Boolean(v) => Arc::new(BooleanArray::from(vec![*v; len])),
            DefaultValue::Int64(v) => Arc::new(Int64Array::from(vec![*v; len])),
            DefaultValue::Float64(v) => Arc::new(Float64Array::from(vec![*v; len])),
            DefaultValue::String(v) => Arc::new(StringArray::from(vec![v.as_str(); len])),
        }
    }
}

/// Handler appending constant columns a batch does not have
#[derive(Debug, Clone)]
pub struct DefaultHandler {
    defaults: Vec<(String, DefaultValue)>,
}

impl DefaultHandler {
    /// Returns `Config` on an empty list or a repeated column name
    pub fn new(defaults: Vec<(String, DefaultValue)>) -> Result<Self> {
        if defaults.is_empty() {
            return Err(Error::config("default handler needs at least one column"));
        }
        let mut seen = HashSet::new();
        for (name, _) in &defaults {
            if !seen.insert(name.as_str()) {
                return Err(Error::config(format!("duplicate default column: {}", name)));
            }
        }
        Ok(Self { defaults })
    }
}

impl RecordBatchHandler for DefaultHandler {
    fn handle(&mut self, batch: RecordBatch) -> Result<Vec<RecordBatch>> {
        let schema = batch.schema();
        let missing: Vec<&(String, DefaultValue)> = self
            .defaults
            .iter()
            .filter(|(name, _)| schema.column_with_name(name).is_none())
            .collect();

        if missing.is_empty() {
            return Ok(vec![batch]);
        }
        debug!("Adding {} default columns", missing.len());

        let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
        let mut columns = batch.columns().to_vec();
        for (name, value) in missing {
            fields.push(with_column_type(
                &Field::new(name, value.data_type(), false),
                ColumnType::Field,
            ));
            columns.push(value.to_array(batch.num_rows()));
        }

        let schema = Schema::new_with_metadata(fields, schema.metadata().clone());
        Ok(vec![RecordBatch::try_new(Arc::new(schema), columns)?])
    }

    fn name(&self) -> &'static str {
        "default"
    }
}
