//! Aggregate handler for folding batches into one row per group
//!
//! Every non-empty input batch collapses into a single row holding:
//! - the folded time column (`first`, `last`, `min` or `max` of the event times)
//! - the group descriptor values, when the batch is grouped
//! - the measurement of the first row, when enabled with
//!   [`AggregateOptions::with_keep_measurement`]
//! - one column per configured [`AggregateSpec`]
//!
//! Rows of batches sharing a group descriptor are then concatenated, so a
//! batch set yields one output batch per distinct group.
//!
//! # Example
//!
//! ```rust,ignore
//! use kuba_stream::handlers::{AggregateHandler, AggregateOptions, RecordBatchHandler};
//!
//! let options = AggregateOptions::new(vec!["mean(cpu) as cpu_mean".parse()?]);
//! let mut handler = AggregateHandler::new(options)?;
//! let rows = handler.handle_batches(grouped)?;
//! ```

pub mod functions;
pub mod numeric;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch};
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use tracing::debug;

pub use functions::AggregateFunction;

use super::RecordBatchHandler;
use crate::error::{Error, Result};
use crate::metadata::{
    extract_group_metadata, measurement_column_name, time_column_name, with_column_type,
    ColumnType, GroupDescriptor, MEASUREMENT_COLUMN_NAME_METADATA_KEY,
    TIME_COLUMN_NAME_METADATA_KEY,
};

// ============================================================================
// Options
// ============================================================================

/// One aggregated output column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateSpec {
    /// Input column
    pub column: String,
    pub function: AggregateFunction,
    /// Output column name
    pub result_column: String,
}

impl AggregateSpec {
    /// Fold `column` with `function` into a column of the same name
    pub fn new(column: impl Into<String>, function: AggregateFunction) -> Self {
        let column = column.into();
        Self {
            result_column: column.clone(),
            column,
            function,
        }
    }

    pub fn with_result_column(mut self, result_column: impl Into<String>) -> Self {
        self.result_column = result_column.into();
        self
    }
}

impl FromStr for AggregateSpec {
    type Err = Error;

    /// Parse `fn(column)` or `fn(column) as result`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::config(format!("invalid aggregate spec: {:?}", s));

        let s = s.trim();
        let (expr, result) = match s.to_ascii_lowercase().find(" as ") {
            Some(i) => (s[..i].trim(), Some(s[i + 4..].trim())),
            None => (s, None),
        };

        let open = expr.find('(').ok_or_else(invalid)?;
        if !expr.ends_with(')') {
            return Err(invalid());
        }
        let function: AggregateFunction = expr[..open].parse()?;
        let column = expr[open + 1..expr.len() - 1].trim();
        if column.is_empty() {
            return Err(invalid());
        }

        let spec = AggregateSpec::new(column, function);
        match result {
            Some("") => Err(invalid()),
            Some(result) => Ok(spec.with_result_column(result)),
            None => Ok(spec),
        }
    }
}

impl fmt::Display for AggregateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.function, self.column)?;
        if self.result_column != self.column {
            write!(f, " as {}", self.result_column)?;
        }
        Ok(())
    }
}

/// How the event-time column is folded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeAggregateRule {
    function: AggregateFunction,
    /// Output time column name, the input name when `None`
    result_column: Option<String>,
}

impl TimeAggregateRule {
    /// Returns `Config` unless `function` picks one of the input times
    pub fn new(function: AggregateFunction, result_column: Option<String>) -> Result<Self> {
        if !function.is_selector() {
            return Err(Error::config(format!(
                "time column can only be folded with first, last, min or max, not {}",
                function
            )));
        }
        Ok(Self {
            function,
            result_column,
        })
    }

    pub fn function(&self) -> AggregateFunction {
        self.function
    }

    pub fn result_column(&self) -> Option<&str> {
        self.result_column.as_deref()
    }
}

impl Default for TimeAggregateRule {
    fn default() -> Self {
        Self {
            function: AggregateFunction::Last,
            result_column: None,
        }
    }
}

/// Aggregate configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateOptions {
    pub specs: Vec<AggregateSpec>,
    pub time_rule: TimeAggregateRule,
    /// Carry the first-row measurement so folded rows convert back to points
    pub keep_measurement: bool,
}

impl AggregateOptions {
    pub fn new(specs: Vec<AggregateSpec>) -> Self {
        Self {
            specs,
            time_rule: TimeAggregateRule::default(),
            keep_measurement: false,
        }
    }

    pub fn with_time_rule(mut self, time_rule: TimeAggregateRule) -> Self {
        self.time_rule = time_rule;
        self
    }

    pub fn with_keep_measurement(mut self, keep: bool) -> Self {
        self.keep_measurement = keep;
        self
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Handler folding each batch into a single row
#[derive(Debug, Clone)]
pub struct AggregateHandler {
    options: AggregateOptions,
}

impl AggregateHandler {
    /// Create an aggregate handler
    ///
    /// Returns `Config` when two specs write the same result column.
    pub fn new(options: AggregateOptions) -> Result<Self> {
        let mut seen = HashSet::new();
        for spec in &options.specs {
            if !seen.insert(spec.result_column.as_str()) {
                return Err(Error::config(format!(
                    "duplicate aggregate result column: {}",
                    spec.result_column
                )));
            }
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &AggregateOptions {
        &self.options
    }

    fn writes_column(&self, name: &str) -> bool {
        self.options.specs.iter().any(|spec| spec.result_column == name)
    }

    /// Fold one batch, `None` when it has no rows
    fn aggregate_batch(&self, batch: &RecordBatch) -> Result<Option<RecordBatch>> {
        let time_name = time_column_name(batch)?;
        let schema = batch.schema();
        let (time_index, time_field) = schema
            .column_with_name(&time_name)
            .ok_or_else(|| Error::schema(format!("time column {} is missing", time_name)))?;
        if !matches!(time_field.data_type(), DataType::Timestamp(_, _)) {
            return Err(Error::type_error(format!(
                "time column {} must have timestamp type, got {}",
                time_name,
                time_field.data_type()
            )));
        }

        if batch.num_rows() == 0 {
            return Ok(None);
        }

        let result_time = self
            .options
            .time_rule
            .result_column()
            .unwrap_or(&time_name)
            .to_string();

        let descriptor = extract_group_metadata(batch)?;

        let measurement_name = measurement_column_name(batch).ok();
        let measurement = measurement_name.clone().filter(|name| {
            self.options.keep_measurement
                && *name != result_time
                && !self.writes_column(name)
                && !descriptor
                    .as_ref()
                    .is_some_and(|d| d.columns().any(|c| c == name.as_str()))
        });

        let mut names: HashSet<String> = HashSet::new();
        let mut fields: Vec<Field> = Vec::new();
        let mut columns: Vec<ArrayRef> = Vec::new();
        let mut push = |field: Field, column: ArrayRef| -> Result<()> {
            if !names.insert(field.name().clone()) {
                return Err(Error::config(format!(
                    "duplicate aggregate output column: {}",
                    field.name()
                )));
            }
            fields.push(field);
            columns.push(column);
            Ok(())
        };

        push(
            with_column_type(time_field, ColumnType::Time).with_name(result_time.clone()),
            self.options
                .time_rule
                .function()
                .evaluate(batch.column(time_index))?,
        )?;

        if let Some(descriptor) = &descriptor {
            for name in descriptor.columns() {
                let (index, field) = schema
                    .column_with_name(name)
                    .ok_or_else(|| Error::schema(format!("no such group column: {}", name)))?;
                push(field.clone(), batch.column(index).slice(0, 1))?;
            }
        }

        if let Some((index, field)) = measurement
            .as_deref()
            .and_then(|name| schema.column_with_name(name))
        {
            push(field.clone(), batch.column(index).slice(0, 1))?;
        }

        for spec in &self.options.specs {
            let (index, field) = schema
                .column_with_name(&spec.column)
                .ok_or_else(|| Error::schema(format!("no such aggregate column: {}", spec.column)))?;
            let value = spec.function.evaluate(batch.column(index))?;
            let result_field = if spec.function.is_selector() {
                field.clone()
            } else {
                with_column_type(
                    &Field::new(&spec.result_column, value.data_type().clone(), true),
                    ColumnType::Field,
                )
            };
            push(
                result_field.with_name(spec.result_column.clone()).with_nullable(true),
                value,
            )?;
        }

        let mut metadata = schema.metadata().clone();
        metadata.insert(TIME_COLUMN_NAME_METADATA_KEY.to_string(), result_time);
        if measurement_name.is_some_and(|name| !fields.iter().any(|f| f.name() == &name)) {
            metadata.remove(MEASUREMENT_COLUMN_NAME_METADATA_KEY);
        }

        let output = RecordBatch::try_new(
            Arc::new(Schema::new_with_metadata(fields, metadata)),
            columns,
        )?;
        Ok(Some(output))
    }
}

impl RecordBatchHandler for AggregateHandler {
    fn handle(&mut self, batch: RecordBatch) -> Result<Vec<RecordBatch>> {
        self.handle_batches(vec![batch])
    }

    fn handle_batches(&mut self, batches: Vec<RecordBatch>) -> Result<Vec<RecordBatch>> {
        if batches.is_empty() {
            return Err(Error::capacity("aggregate handler needs at least one batch"));
        }

        let mut slots: HashMap<Option<GroupDescriptor>, usize> = HashMap::new();
        let mut classes: Vec<Vec<RecordBatch>> = Vec::new();

        for batch in &batches {
            let Some(row) = self.aggregate_batch(batch)? else {
                continue;
            };
            let descriptor = extract_group_metadata(batch)?;
            let slot = *slots.entry(descriptor).or_insert_with(|| {
                classes.push(Vec::new());
                classes.len() - 1
            });
            classes[slot].push(row);
        }

        debug!(
            "Aggregated {} batches into {} groups",
            batches.len(),
            classes.len()
        );

        classes.into_iter().map(concat_class).collect()
    }

    fn name(&self) -> &'static str {
        "aggregate"
    }
}

/// Concatenate the rows of one group under the schema of its first row
fn concat_class(rows: Vec<RecordBatch>) -> Result<RecordBatch> {
    let schema: SchemaRef = rows[0].schema();
    let aligned = rows
        .iter()
        .map(|row| {
            let same_types = row.num_columns() == schema.fields().len()
                && row
                    .schema_ref()
                    .fields()
                    .iter()
                    .zip(schema.fields())
                    .all(|(a, b)| a.name() == b.name() && a.data_type() == b.data_type());
            if !same_types {
                return Err(Error::type_error(format!(
                    "aggregated batches of one group disagree on columns: {} vs {}",
                    row.schema_ref(),
                    schema
                )));
            }
            Ok(RecordBatch::try_new(schema.clone(), row.columns().to_vec())?)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(concat_batches(&schema, &aligned)?)
}
