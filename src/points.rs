//! Conversion between points and record batches
//!
//! A point is one metric observation: a measurement name, a set of string
//! tags, a set of typed fields and a timestamp. A list of points maps onto a
//! single batch with one column per tag and per field:
//!
//! | Column              | Type                    | Role          |
//! |---------------------|-------------------------|---------------|
//! | time                | `Timestamp(ns, "UTC")`  | `TIME`        |
//! | measurement         | `Utf8`                  | `MEASUREMENT` |
//! | one per tag key     | `Utf8`                  | `TAG`         |
//! | one per field key   | from the field values   | `FIELD`       |
//!
//! Tag and field columns are sorted by name. A point lacking a tag or field
//! gets a null in that column.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampNanosecondArray, UInt64Array,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema, TimeUnit, UInt64Type};
use arrow::util::display::array_value_to_string;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metadata::{
    column_type, event_times, measurement_column_name, time_column_name, with_column_type,
    ColumnType, MEASUREMENT_COLUMN_NAME_METADATA_KEY, TIME_COLUMN_NAME_METADATA_KEY,
};

// ============================================================================
// Points
// ============================================================================

/// Field value types carried by a point
///
/// Variant order drives untagged deserialization: JSON integers become
/// `Integer` and only fall through to `UInteger` above `i64::MAX`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit unsigned integer
    UInteger(u64),
    /// 64-bit floating point value
    Float(f64),
    /// UTF-8 string value
    String(String),
    /// Boolean value
    Boolean(bool),
}

impl FieldValue {
    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Float(_) => "float",
            FieldValue::Integer(_) => "integer",
            FieldValue::UInteger(_) => "uinteger",
            FieldValue::String(_) => "string",
            FieldValue::Boolean(_) => "boolean",
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            FieldValue::Float(_) => DataType::Float64,
            FieldValue::Integer(_) => DataType::Int64,
            FieldValue::UInteger(_) => DataType::UInt64,
            FieldValue::String(_) => DataType::Utf8,
            FieldValue::Boolean(_) => DataType::Boolean,
        }
    }

    /// Try to get as f64 (converts integers to float)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::UInteger(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// One metric observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Names of the time and measurement columns in converted batches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    pub time_column: String,
    pub measurement_column: String,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            time_column: "time".to_string(),
            measurement_column: "measurement".to_string(),
        }
    }
}

// ============================================================================
// Converter
// ============================================================================

/// Converts between point lists and record batches
#[derive(Debug, Clone, Default)]
pub struct PointsConverter {
    options: ConversionOptions,
}

impl PointsConverter {
    pub fn new(options: ConversionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ConversionOptions {
        &self.options
    }

    /// Build one batch holding every point
    ///
    /// Fails with `Capacity` on an empty list and with `Type` when a field
    /// key carries values of different types.
    pub fn to_record_batch(&self, points: &[Point]) -> Result<RecordBatch> {
        if points.is_empty() {
            return Err(Error::capacity("cannot build a batch from zero points"));
        }

        let reserved = [&self.options.time_column, &self.options.measurement_column];
        let tag_keys: BTreeSet<&str> = points
            .iter()
            .flat_map(|p| p.tags.keys().map(String::as_str))
            .collect();

        let mut field_types: BTreeMap<&str, DataType> = BTreeMap::new();
        for point in points {
            for (key, value) in &point.fields {
                let data_type = value.data_type();
                match field_types.get(key.as_str()) {
                    Some(existing) if *existing != data_type => {
                        return Err(Error::type_error(format!(
                            "field {} has conflicting types {} and {}",
                            key,
                            existing,
                            value.type_name()
                        )));
                    }
                    Some(_) => {}
                    None => {
                        field_types.insert(key.as_str(), data_type);
                    }
                }
            }
        }

        for key in tag_keys.iter().chain(field_types.keys()) {
            if reserved.iter().any(|r| r.as_str() == *key) {
                return Err(Error::schema(format!("column name {} is reserved", key)));
            }
        }
        if let Some(key) = tag_keys.iter().find(|k| field_types.contains_key(*k)) {
            return Err(Error::schema(format!("{} is used as both tag and field", key)));
        }

        let nanos = points
            .iter()
            .map(|p| {
                p.timestamp.timestamp_nanos_opt().ok_or_else(|| {
                    Error::type_error(format!("timestamp {} is out of range", p.timestamp))
                })
            })
            .collect::<Result<Vec<i64>>>()?;

        let time_type = DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into()));
        let mut fields = vec![
            with_column_type(
                &Field::new(&self.options.time_column, time_type, false),
                ColumnType::Time,
            ),
            with_column_type(
                &Field::new(&self.options.measurement_column, DataType::Utf8, false),
                ColumnType::Measurement,
            ),
        ];
        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(TimestampNanosecondArray::from(nanos).with_timezone("UTC")),
            Arc::new(StringArray::from_iter_values(
                points.iter().map(|p| p.measurement.as_str()),
            )),
        ];

        for key in &tag_keys {
            fields.push(with_column_type(
                &Field::new(*key, DataType::Utf8, true),
                ColumnType::Tag,
            ));
            columns.push(Arc::new(StringArray::from(
                points
                    .iter()
                    .map(|p| p.tags.get(*key).map(String::as_str))
                    .collect::<Vec<_>>(),
            )));
        }

        for (key, data_type) in &field_types {
            let values = points.iter().map(|p| p.fields.get(*key));
            let column: ArrayRef = match data_type {
                DataType::Float64 => Arc::new(Float64Array::from(
                    values
                        .map(|v| match v {
                            Some(FieldValue::Float(f)) => Some(*f),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
                DataType::Int64 => Arc::new(Int64Array::from(
                    values
                        .map(|v| match v {
                            Some(FieldValue::Integer(i)) => Some(*i),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
                DataType::UInt64 => Arc::new(UInt64Array::from(
                    values
                        .map(|v| match v {
                            Some(FieldValue::UInteger(u)) => Some(*u),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
                DataType::Boolean => Arc::new(BooleanArray::from(
                    values
                        .map(|v| match v {
                            Some(FieldValue::Boolean(b)) => Some(*b),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
                _ => Arc::new(StringArray::from(
                    values
                        .map(|v| match v {
                            Some(FieldValue::String(s)) => Some(s.as_str()),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
            };
            fields.push(with_column_type(
                &Field::new(*key, data_type.clone(), true),
                ColumnType::Field,
            ));
            columns.push(column);
        }

        let metadata = HashMap::from([
            (
                TIME_COLUMN_NAME_METADATA_KEY.to_string(),
                self.options.time_column.clone(),
            ),
            (
                MEASUREMENT_COLUMN_NAME_METADATA_KEY.to_string(),
                self.options.measurement_column.clone(),
            ),
        ]);

        Ok(RecordBatch::try_new(
            Arc::new(Schema::new_with_metadata(fields, metadata)),
            columns,
        )?)
    }

    /// Turn batches back into points, one per row
    ///
    /// `TAG` columns become tags and `FIELD` columns become fields. Columns
    /// without a role become fields when their type maps onto a
    /// [`FieldValue`], and are skipped otherwise. Null cells are skipped.
    pub fn to_points(&self, batches: &[RecordBatch]) -> Result<Vec<Point>> {
        let mut points = Vec::with_capacity(batches.iter().map(|b| b.num_rows()).sum());
        for batch in batches {
            self.batch_to_points(batch, &mut points)?;
        }
        Ok(points)
    }

    fn batch_to_points(&self, batch: &RecordBatch, points: &mut Vec<Point>) -> Result<()> {
        let time_name = time_column_name(batch)?;
        let measurement_name = measurement_column_name(batch)?;
        let times = event_times(batch)?;
        let measurements = batch
            .column_by_name(&measurement_name)
            .ok_or_else(|| Error::schema(format!("measurement column {} is missing", measurement_name)))?;
        let measurements = measurements
            .as_string_opt::<i32>()
            .ok_or_else(|| Error::type_error("measurement column must be Utf8"))?;

        let mut tags: Vec<(&str, &ArrayRef)> = Vec::new();
        let mut fields: Vec<(&str, FieldReader)> = Vec::new();
        for (field, column) in batch.schema_ref().fields().iter().zip(batch.columns()) {
            let name = field.name().as_str();
            if name == time_name || name == measurement_name {
                continue;
            }
            match column_type(field) {
                ColumnType::Tag => tags.push((name, column)),
                ColumnType::Field => fields.push((name, FieldReader::new(name, column)?)),
                ColumnType::Unknown => {
                    if let Ok(reader) = FieldReader::new(name, column) {
                        fields.push((name, reader));
                    }
                }
                ColumnType::Time | ColumnType::Measurement => {}
            }
        }

        for row in 0..batch.num_rows() {
            let nanos = times[row]
                .ok_or_else(|| Error::schema(format!("null event time at row {}", row)))?;
            if measurements.is_null(row) {
                return Err(Error::schema(format!("null measurement at row {}", row)));
            }

            let mut point = Point::new(measurements.value(row), Utc.timestamp_nanos(nanos));
            for (name, column) in &tags {
                if column.is_valid(row) {
                    point.tags.insert(name.to_string(), array_value_to_string(column, row)?);
                }
            }
            for (name, reader) in &fields {
                if let Some(value) = reader.value(row) {
                    point.fields.insert(name.to_string(), value);
                }
            }
            points.push(point);
        }

        Ok(())
    }
}

/// Typed view over a field column
enum FieldReader {
    Float(Float64Array),
    Integer(Int64Array),
    UInteger(UInt64Array),
    String(StringArray),
    Boolean(BooleanArray),
}

impl FieldReader {
    fn new(name: &str, column: &ArrayRef) -> Result<Self> {
        let data_type = column.data_type();
        let reader = if data_type.is_floating() {
            FieldReader::Float(cast(column, &DataType::Float64)?.as_primitive::<Float64Type>().clone())
        } else if data_type.is_signed_integer() {
            FieldReader::Integer(cast(column, &DataType::Int64)?.as_primitive::<Int64Type>().clone())
        } else if data_type.is_unsigned_integer() {
            FieldReader::UInteger(cast(column, &DataType::UInt64)?.as_primitive::<UInt64Type>().clone())
        } else {
            match data_type {
                DataType::Utf8 | DataType::LargeUtf8 => {
                    FieldReader::String(cast(column, &DataType::Utf8)?.as_string::<i32>().clone())
                }
                DataType::Boolean => FieldReader::Boolean(column.as_boolean().clone()),
                other => {
                    return Err(Error::type_error(format!(
                        "field column {} has unsupported type {}",
                        name, other
                    )))
                }
            }
        };
        Ok(reader)
    }

    fn value(&self, row: usize) -> Option<FieldValue> {
        match self {
            FieldReader::Float(a) => a.is_valid(row).then(|| FieldValue::Float(a.value(row))),
            FieldReader::Integer(a) => a.is_valid(row).then(|| FieldValue::Integer(a.value(row))),
            FieldReader::UInteger(a) => a.is_valid(row).then(|| FieldValue::UInteger(a.value(row))),
            FieldReader::String(a) => a
                .is_valid(row)
                .then(|| FieldValue::String(a.value(row).to_string())),
            FieldReader::Boolean(a) => a.is_valid(row).then(|| FieldValue::Boolean(a.value(row))),
        }
    }
}
