//! Group descriptor stored in batch schema metadata
//!
//! A grouped batch carries the `(column, value)` pairs every one of its rows
//! shares. The descriptor is serialized as a JSON object under the `group`
//! schema metadata key, with `null` for null values.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, RecordBatch};
use arrow::datatypes::{DataType, Float32Type, Float64Type};
use arrow::util::display::array_value_to_string;
use serde::{Deserialize, Serialize};

use super::set_schema_metadata_value;
use crate::error::{Error, Result};

/// Schema metadata key holding the serialized group descriptor
pub const GROUP_METADATA_KEY: &str = "group";

/// Set of grouping-column values shared by every row of a batch
///
/// Pairs are ordered by column name, so two descriptors compare equal iff
/// they hold the same pairs. `None` marks a null value and is distinct from
/// every string, the empty string included. Float zeros of either sign share
/// the value `0.0`, and all NaNs share `NaN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupDescriptor {
    values: BTreeMap<String, Option<String>>,
}

impl GroupDescriptor {
    /// Create an empty descriptor
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one pair
    pub fn insert(&mut self, column: impl Into<String>, value: Option<String>) {
        self.values.insert(column.into(), value);
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with(mut self, column: impl Into<String>, value: Option<&str>) -> Self {
        self.insert(column, value.map(str::to_string));
        self
    }

    /// Value recorded for `column`, `Some(None)` when the group value is null
    pub fn get(&self, column: &str) -> Option<Option<&str>> {
        self.values.get(column).map(|value| value.as_deref())
    }

    /// Iterate pairs in column-name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.values
            .iter()
            .map(|(column, value)| (column.as_str(), value.as_deref()))
    }

    /// Grouping column names in column-name order
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Serialize to the wire form
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the wire form
    pub fn from_json(value: &str) -> Result<Self> {
        serde_json::from_str(value)
            .map_err(|e| Error::schema(format!("malformed group metadata {:?}: {}", value, e)))
    }
}

impl fmt::Display for GroupDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (column, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", column, value.unwrap_or("null"))?;
        }
        Ok(())
    }
}

/// Stringified value of one cell, `None` for null
pub(crate) fn cell_to_group_value(column: &ArrayRef, row: usize) -> Result<Option<String>> {
    if column.is_null(row) {
        return Ok(None);
    }
    let cell = canonical_group_keys(&column.slice(row, 1));
    Ok(Some(array_value_to_string(&cell, 0)?))
}

/// Group key view of a column: `-0.0` becomes `0.0` and every NaN the same NaN
///
/// Other types are returned unchanged.
pub(crate) fn canonical_group_keys(column: &ArrayRef) -> ArrayRef {
    match column.data_type() {
        DataType::Float64 => Arc::new(
            column
                .as_primitive::<Float64Type>()
                .unary::<_, Float64Type>(|v| if v.is_nan() { f64::NAN } else { v + 0.0 }),
        ),
        DataType::Float32 => Arc::new(
            column
                .as_primitive::<Float32Type>()
                .unary::<_, Float32Type>(|v| if v.is_nan() { f32::NAN } else { v + 0.0 }),
        ),
        _ => Arc::clone(column),
    }
}

/// Compute the descriptor of `batch` from its first row and store it
///
/// The caller guarantees every row shares the values of `columns`.
pub fn fill_group_metadata(batch: RecordBatch, columns: &[String]) -> Result<RecordBatch> {
    if batch.num_rows() == 0 {
        return Err(Error::capacity("cannot derive group metadata from an empty batch"));
    }

    let mut descriptor = GroupDescriptor::new();
    for name in columns {
        let column = batch
            .column_by_name(name)
            .ok_or_else(|| Error::schema(format!("no such group column: {}", name)))?;
        descriptor.insert(name.clone(), cell_to_group_value(column, 0)?);
    }

    set_group_metadata(batch, &descriptor)
}

/// Read the descriptor of `batch`, `None` when the batch is ungrouped
pub fn extract_group_metadata(batch: &RecordBatch) -> Result<Option<GroupDescriptor>> {
    batch
        .schema_ref()
        .metadata()
        .get(GROUP_METADATA_KEY)
        .map(|value| GroupDescriptor::from_json(value))
        .transpose()
}

/// Store `descriptor` on `batch`, replacing any previous one
pub fn set_group_metadata(batch: RecordBatch, descriptor: &GroupDescriptor) -> Result<RecordBatch> {
    set_schema_metadata_value(&batch, GROUP_METADATA_KEY, descriptor.to_json()?)
}

/// Drop the descriptor from `batch`, if any
pub(crate) fn clear_group_metadata(batch: RecordBatch) -> Result<RecordBatch> {
    if !batch.schema_ref().metadata().contains_key(GROUP_METADATA_KEY) {
        return Ok(batch);
    }
    let mut metadata = batch.schema_ref().metadata().clone();
    metadata.remove(GROUP_METADATA_KEY);
    let schema = batch.schema_ref().as_ref().clone().with_metadata(metadata);
    super::with_schema(&batch, schema)
}
