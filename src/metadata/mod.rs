//! Columnar batch metadata model
//!
//! Record batches carry their semantics in Arrow schema metadata:
//!
//! - **Schema level**: `time_column_name`, `measurement_column_name` and the
//!   group descriptor (see [`grouping`])
//! - **Field level**: a `column_type` role from the closed [`ColumnType`] set
//!
//! Handlers never read the raw keys directly. They go through the typed
//! accessors in this module, which validate that the named column exists and
//! has the type its role requires. The wire keys stay plain strings so batches
//! interoperate with anything else that speaks the same convention.
//!
//! # Example
//!
//! ```rust,ignore
//! use kuba_stream::metadata::{self, ColumnType};
//!
//! let batch = metadata::set_time_column(batch, "time")?;
//! assert_eq!(metadata::time_column_name(&batch)?, "time");
//! ```

pub mod grouping;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{ArrayRef, AsArray, RecordBatch, RecordBatchOptions};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Int64Type, Schema, TimeUnit};

use crate::error::{Error, Result};

pub(crate) use grouping::clear_group_metadata;
pub use grouping::{extract_group_metadata, fill_group_metadata, set_group_metadata, GroupDescriptor};

/// Field metadata key holding the column role
pub const COLUMN_TYPE_METADATA_KEY: &str = "column_type";

/// Schema metadata key naming the event-time column
pub const TIME_COLUMN_NAME_METADATA_KEY: &str = "time_column_name";

/// Schema metadata key naming the measurement column
pub const MEASUREMENT_COLUMN_NAME_METADATA_KEY: &str = "measurement_column_name";

// ============================================================================
// Column Roles
// ============================================================================

/// Semantic role of a column within a metrics batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColumnType {
    /// No role assigned
    #[default]
    Unknown,
    /// Event timestamp
    Time,
    /// Metric name
    Measurement,
    /// Dimension (indexed label)
    Tag,
    /// Measured value
    Field,
}

impl ColumnType {
    /// Wire name of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Unknown => "UNKNOWN",
            ColumnType::Time => "TIME",
            ColumnType::Measurement => "MEASUREMENT",
            ColumnType::Tag => "TAG",
            ColumnType::Field => "FIELD",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UNKNOWN" => Ok(ColumnType::Unknown),
            "TIME" => Ok(ColumnType::Time),
            "MEASUREMENT" => Ok(ColumnType::Measurement),
            "TAG" => Ok(ColumnType::Tag),
            "FIELD" => Ok(ColumnType::Field),
            other => Err(Error::schema(format!("unknown column type: {}", other))),
        }
    }
}

/// Read the role of a field, falling back to `Unknown`
pub fn column_type(field: &Field) -> ColumnType {
    field
        .metadata()
        .get(COLUMN_TYPE_METADATA_KEY)
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}

/// Return a copy of `field` tagged with `column_type`
pub fn with_column_type(field: &Field, column_type: ColumnType) -> Field {
    let mut metadata = field.metadata().clone();
    metadata.insert(
        COLUMN_TYPE_METADATA_KEY.to_string(),
        column_type.as_str().to_string(),
    );
    field.clone().with_metadata(metadata)
}

/// Tag the named column of `batch` with a role
pub fn set_column_type(
    batch: RecordBatch,
    column_name: &str,
    column_type: ColumnType,
) -> Result<RecordBatch> {
    let schema = batch.schema();
    let (index, _) = schema
        .column_with_name(column_name)
        .ok_or_else(|| Error::schema(format!("no such column: {}", column_name)))?;

    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(i, field)| {
            if i == index {
                with_column_type(field, column_type)
            } else {
                field.as_ref().clone()
            }
        })
        .collect();

    let new_schema = Schema::new_with_metadata(fields, schema.metadata().clone());
    with_schema(&batch, new_schema)
}

// ============================================================================
// Time and Measurement Columns
// ============================================================================

/// Mark `column_name` as the event-time column of `batch`
///
/// The column must exist and be timestamp-typed. It is also tagged `TIME`.
pub fn set_time_column(batch: RecordBatch, column_name: &str) -> Result<RecordBatch> {
    set_column_name_metadata(
        batch,
        column_name,
        TIME_COLUMN_NAME_METADATA_KEY,
        ColumnType::Time,
        |data_type| matches!(data_type, DataType::Timestamp(_, _)),
    )
}

/// Name of the event-time column
pub fn time_column_name(batch: &RecordBatch) -> Result<String> {
    column_name_metadata(batch, TIME_COLUMN_NAME_METADATA_KEY)
}

/// Mark `column_name` as the measurement column of `batch`
///
/// The column must exist and be a UTF-8 string column.
pub fn set_measurement_column(batch: RecordBatch, column_name: &str) -> Result<RecordBatch> {
    set_column_name_metadata(
        batch,
        column_name,
        MEASUREMENT_COLUMN_NAME_METADATA_KEY,
        ColumnType::Measurement,
        |data_type| matches!(data_type, DataType::Utf8),
    )
}

/// Name of the measurement column
pub fn measurement_column_name(batch: &RecordBatch) -> Result<String> {
    column_name_metadata(batch, MEASUREMENT_COLUMN_NAME_METADATA_KEY)
}

/// Event times of `batch` normalized to nanoseconds since the epoch
pub fn event_times(batch: &RecordBatch) -> Result<Vec<Option<i64>>> {
    let name = time_column_name(batch)?;
    let column = batch
        .column_by_name(&name)
        .ok_or_else(|| Error::schema(format!("time column {} is missing", name)))?;
    timestamps_as_nanos(column)
}

/// Convert a timestamp array of any unit into nanoseconds
pub fn timestamps_as_nanos(column: &ArrayRef) -> Result<Vec<Option<i64>>> {
    let scale = match column.data_type() {
        DataType::Timestamp(TimeUnit::Second, _) => 1_000_000_000,
        DataType::Timestamp(TimeUnit::Millisecond, _) => 1_000_000,
        DataType::Timestamp(TimeUnit::Microsecond, _) => 1_000,
        DataType::Timestamp(TimeUnit::Nanosecond, _) => 1,
        other => {
            return Err(Error::type_error(format!(
                "time column must have timestamp type, got {}",
                other
            )))
        }
    };

    let raw = cast(column, &DataType::Int64)?;
    Ok(raw
        .as_primitive::<Int64Type>()
        .iter()
        .map(|value| value.map(|v| v.saturating_mul(scale)))
        .collect())
}

// ============================================================================
// Copy Helpers
// ============================================================================

/// Replace the schema metadata of `to` with the schema metadata of `from`
pub fn copy_schema_metadata(from: &RecordBatch, to: RecordBatch) -> Result<RecordBatch> {
    if from.schema_ref().metadata().is_empty() {
        return Ok(to);
    }
    let schema = to
        .schema_ref()
        .as_ref()
        .clone()
        .with_metadata(from.schema_ref().metadata().clone());
    with_schema(&to, schema)
}

/// Copy column roles from `from` onto same-named, same-typed fields of `to`
pub fn copy_column_types(from: &RecordBatch, to: RecordBatch) -> Result<RecordBatch> {
    let source = from.schema();
    let target = to.schema();

    let fields: Vec<Field> = target
        .fields()
        .iter()
        .map(|field| match source.column_with_name(field.name()) {
            Some((_, source_field)) if source_field.data_type() == field.data_type() => {
                with_column_type(field, column_type(source_field))
            }
            _ => field.as_ref().clone(),
        })
        .collect();

    with_schema(&to, Schema::new_with_metadata(fields, target.metadata().clone()))
}

/// Rebuild `batch` with a new schema describing the same columns
///
/// Row count is carried explicitly so zero-column batches survive.
pub(crate) fn with_schema(batch: &RecordBatch, schema: Schema) -> Result<RecordBatch> {
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(schema),
        batch.columns().to_vec(),
        &options,
    )?)
}

/// Set one schema metadata key, keeping everything else
pub(crate) fn set_schema_metadata_value(
    batch: &RecordBatch,
    key: &str,
    value: String,
) -> Result<RecordBatch> {
    let mut metadata: HashMap<String, String> = batch.schema_ref().metadata().clone();
    metadata.insert(key.to_string(), value);
    let schema = batch.schema_ref().as_ref().clone().with_metadata(metadata);
    with_schema(batch, schema)
}

fn column_name_metadata(batch: &RecordBatch, key: &str) -> Result<String> {
    batch
        .schema_ref()
        .metadata()
        .get(key)
        .cloned()
        .ok_or_else(|| Error::schema(format!("batch metadata has no {} key", key)))
}

fn set_column_name_metadata(
    batch: RecordBatch,
    column_name: &str,
    key: &str,
    role: ColumnType,
    accepts: impl Fn(&DataType) -> bool,
) -> Result<RecordBatch> {
    let data_type = batch
        .schema_ref()
        .field_with_name(column_name)
        .map(|field| field.data_type().clone())
        .map_err(|_| Error::schema(format!("no such column to set {}: {}", key, column_name)))?;

    if !accepts(&data_type) {
        return Err(Error::type_error(format!(
            "column {} cannot be used as {}: unexpected type {}",
            column_name, key, data_type
        )));
    }

    let batch = set_column_type(batch, column_name, role)?;
    set_schema_metadata_value(&batch, key, column_name.to_string())
}
