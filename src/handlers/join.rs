//! Join handler for merging sources on keys within a time tolerance
//!
//! Each input batch is one source. Rows from different sources that share
//! the join-key values and whose event times lie within the tolerance of
//! each other are merged into a single output row.
//!
//! # Matching
//!
//! Candidate rows are visited in ascending `(time, source, row)` order. A
//! candidate merges into the earliest-opened output row of its join group
//! that has no contribution from its source yet and whose time is at most
//! `tolerance` before the candidate. Otherwise it opens a new output row
//! carrying the candidate's time. Rows older than `tolerance` relative to the
//! current candidate are closed and never matched again.
//!
//! When several contributing sources carry the same field, the lowest source
//! index wins.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{new_null_array, Array, ArrayRef, Int64Array, RecordBatch};
use arrow::compute::{cast, interleave};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::row::{OwnedRow, RowConverter, SortField};
use tracing::debug;

use super::RecordBatchHandler;
use crate::error::{Error, Result};
use crate::metadata::grouping::canonical_group_keys;
use crate::metadata::{
    clear_group_metadata, event_times, extract_group_metadata, time_column_name,
    with_column_type, ColumnType,
};

/// Join configuration
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOptions {
    /// Key columns every source must carry
    pub join_on: Vec<String>,
    /// Maximum event-time distance between merged rows
    pub tolerance: Duration,
}

impl JoinOptions {
    pub fn new(join_on: Vec<String>) -> Self {
        Self {
            join_on,
            tolerance: Duration::ZERO,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// Handler that merges rows across batches on keys and time
#[derive(Debug, Clone)]
pub struct JoinHandler {
    options: JoinOptions,
}

/// One source batch prepared for matching
struct Source<'a> {
    batch: &'a RecordBatch,
    time_column: String,
    times: Vec<i64>,
    keys: Vec<OwnedRow>,
}

/// An output row under construction
struct JoinedRow {
    time: i64,
    group: usize,
    /// Contributing row index per source
    contributions: Vec<Option<usize>>,
}

impl JoinHandler {
    /// Create a join handler
    ///
    /// Returns `Config` if no join column is given.
    pub fn new(options: JoinOptions) -> Result<Self> {
        if options.join_on.is_empty() {
            return Err(Error::config("join handler needs at least one join column"));
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &JoinOptions {
        &self.options
    }

    fn tolerance_nanos(&self) -> i64 {
        i64::try_from(self.options.tolerance.as_nanos()).unwrap_or(i64::MAX)
    }

    fn prepare<'a>(
        &self,
        batches: &'a [RecordBatch],
        converter: &RowConverter,
    ) -> Result<Vec<Source<'a>>> {
        batches
            .iter()
            .enumerate()
            .map(|(index, batch)| {
                let time_column = time_column_name(batch)?;
                let times = event_times(batch)?
                    .into_iter()
                    .map(|t| {
                        t.ok_or_else(|| {
                            Error::schema(format!("source {} has a null event time", index))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;

                let key_arrays = self.key_arrays(batch)?;
                let rows = converter.convert_columns(&key_arrays)?;
                let keys = rows.iter().map(|row| row.owned()).collect();

                Ok(Source {
                    batch,
                    time_column,
                    times,
                    keys,
                })
            })
            .collect()
    }

    fn key_arrays(&self, batch: &RecordBatch) -> Result<Vec<ArrayRef>> {
        self.options
            .join_on
            .iter()
            .map(|name| {
                batch
                    .column_by_name(name)
                    .map(canonical_group_keys)
                    .ok_or_else(|| Error::schema(format!("no such join column: {}", name)))
            })
            .collect()
    }

    /// Key fields taken from the first source, checked against the others
    fn key_fields(&self, batches: &[RecordBatch]) -> Result<Vec<Field>> {
        let first = batches[0].schema();
        let mut fields = Vec::with_capacity(self.options.join_on.len());
        for name in &self.options.join_on {
            let field = first
                .field_with_name(name)
                .map_err(|_| Error::schema(format!("no such join column: {}", name)))?;
            for batch in &batches[1..] {
                let other = batch
                    .schema_ref()
                    .field_with_name(name)
                    .map_err(|_| Error::schema(format!("no such join column: {}", name)))?
                    .data_type()
                    .clone();
                if &other != field.data_type() {
                    return Err(Error::type_error(format!(
                        "join column {} has type {} and {} across sources",
                        name,
                        field.data_type(),
                        other
                    )));
                }
            }
            fields.push(field.clone().with_nullable(true));
        }
        Ok(fields)
    }

    /// Non-key, non-time fields in order of first appearance across sources
    fn value_fields(&self, sources: &[Source<'_>]) -> Result<Vec<Field>> {
        let mut fields: Vec<Field> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let output_time = sources.first().map(|source| source.time_column.as_str());

        for (index, source) in sources.iter().enumerate() {
            for field in source.batch.schema_ref().fields() {
                let name = field.name();
                if name == &source.time_column || self.options.join_on.contains(name) {
                    continue;
                }
                if Some(name.as_str()) == output_time {
                    return Err(Error::schema(format!(
                        "field {} of source {} collides with the output time column",
                        name, index
                    )));
                }
                match positions.get(name) {
                    Some(&i) => {
                        if fields[i].data_type() != field.data_type() {
                            return Err(Error::type_error(format!(
                                "field {} has type {} and {} across sources",
                                name,
                                fields[i].data_type(),
                                field.data_type()
                            )));
                        }
                    }
                    None => {
                        positions.insert(name.clone(), fields.len());
                        fields.push(field.as_ref().clone().with_nullable(true));
                    }
                }
            }
        }

        Ok(fields)
    }

    /// Run the matching pass over every candidate row
    fn match_rows(&self, sources: &[Source<'_>]) -> Vec<JoinedRow> {
        let tolerance = self.tolerance_nanos();

        let mut candidates: Vec<(i64, usize, usize)> = sources
            .iter()
            .enumerate()
            .flat_map(|(s, source)| source.times.iter().enumerate().map(move |(r, &t)| (t, s, r)))
            .collect();
        candidates.sort_unstable();

        let mut groups: HashMap<&OwnedRow, usize> = HashMap::new();
        let mut open: Vec<VecDeque<usize>> = Vec::new();
        let mut rows: Vec<JoinedRow> = Vec::new();

        for (time, s, r) in candidates {
            let next_group = groups.len();
            let group = *groups.entry(&sources[s].keys[r]).or_insert(next_group);
            if group == open.len() {
                open.push(VecDeque::new());
            }
            let open_rows = &mut open[group];

            while let Some(&front) = open_rows.front() {
                if time > rows[front].time.saturating_add(tolerance) {
                    open_rows.pop_front();
                } else {
                    break;
                }
            }

            let target = open_rows
                .iter()
                .copied()
                .find(|&i| rows[i].contributions[s].is_none());

            match target {
                Some(i) => rows[i].contributions[s] = Some(r),
                None => {
                    let mut contributions = vec![None; sources.len()];
                    contributions[s] = Some(r);
                    open_rows.push_back(rows.len());
                    rows.push(JoinedRow {
                        time,
                        group,
                        contributions,
                    });
                }
            }
        }

        // Creation order is the open order; stable sort keeps it for ties.
        rows.sort_by_key(|row| (row.time, row.group));
        rows
    }
}

impl RecordBatchHandler for JoinHandler {
    fn handle(&mut self, batch: RecordBatch) -> Result<Vec<RecordBatch>> {
        self.handle_batches(vec![batch])
    }

    fn handle_batches(&mut self, batches: Vec<RecordBatch>) -> Result<Vec<RecordBatch>> {
        if batches.is_empty() {
            return Err(Error::capacity("join handler needs at least one batch"));
        }

        let key_fields = self.key_fields(&batches)?;
        let converter = RowConverter::new(
            key_fields
                .iter()
                .map(|field| SortField::new(field.data_type().clone()))
                .collect(),
        )?;
        let sources = self.prepare(&batches, &converter)?;
        let value_fields = self.value_fields(&sources)?;
        let rows = self.match_rows(&sources);

        debug!(
            "Joined {} rows from {} sources into {} rows",
            sources.iter().map(|s| s.times.len()).sum::<usize>(),
            sources.len(),
            rows.len()
        );

        let first = &sources[0];
        let time_field = first
            .batch
            .schema_ref()
            .field_with_name(&first.time_column)
            .map_err(|_| Error::schema(format!("time column {} is missing", first.time_column)))?
            .clone();
        let time_array = build_time_column(&rows, time_field.data_type())?;

        let mut fields = vec![with_column_type(&time_field, ColumnType::Time)];
        let mut columns = vec![time_array];

        // Every contribution of a row shares its key, so take the first.
        let key_indices: Vec<(usize, usize)> = rows
            .iter()
            .map(|row| {
                row.contributions
                    .iter()
                    .enumerate()
                    .find_map(|(s, r)| r.map(|r| (s, r)))
                    .unwrap_or((0, 0))
            })
            .collect();
        for (field, name) in key_fields.into_iter().zip(&self.options.join_on) {
            let arrays = sources
                .iter()
                .map(|source| source.batch.column_by_name(name).cloned())
                .collect::<Option<Vec<ArrayRef>>>()
                .ok_or_else(|| Error::schema(format!("no such join column: {}", name)))?;
            columns.push(interleave_arrays(&arrays, &key_indices)?);
            fields.push(field);
        }

        for field in value_fields {
            columns.push(build_value_column(&field, &sources, &rows)?);
            fields.push(field);
        }

        let mut descriptors = batches.iter().map(extract_group_metadata);
        let first_descriptor = descriptors.next().transpose()?.flatten();
        let mut shared = true;
        for descriptor in descriptors {
            if descriptor? != first_descriptor {
                shared = false;
            }
        }

        let schema = Schema::new_with_metadata(fields, first.batch.schema_ref().metadata().clone());
        let output = RecordBatch::try_new(Arc::new(schema), columns)?;
        if shared {
            Ok(vec![output])
        } else {
            Ok(vec![clear_group_metadata(output)?])
        }
    }

    fn name(&self) -> &'static str {
        "join"
    }
}

/// Row times in nanoseconds, converted back to the output time type
fn build_time_column(rows: &[JoinedRow], data_type: &DataType) -> Result<ArrayRef> {
    let divisor = match data_type {
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
    let raw = Int64Array::from_iter_values(rows.iter().map(|row| row.time / divisor));
    Ok(cast(&raw, data_type)?)
}

/// Value column for `field`, taken from the lowest contributing source
fn build_value_column(field: &Field, sources: &[Source<'_>], rows: &[JoinedRow]) -> Result<ArrayRef> {
    let mut arrays: Vec<ArrayRef> = sources
        .iter()
        .map(|source| {
            let column = if field.name() == &source.time_column {
                None
            } else {
                source.batch.column_by_name(field.name())
            };
            column
                .cloned()
                .unwrap_or_else(|| new_null_array(field.data_type(), 0))
        })
        .collect();
    let null_slot = arrays.len();
    arrays.push(new_null_array(field.data_type(), 1));

    let indices: Vec<(usize, usize)> = rows
        .iter()
        .map(|row| {
            row.contributions
                .iter()
                .enumerate()
                .find_map(|(s, r)| match r {
                    Some(r) if !arrays[s].is_empty() => Some((s, *r)),
                    _ => None,
                })
                .unwrap_or((null_slot, 0))
        })
        .collect();

    interleave_arrays(&arrays, &indices)
}

fn interleave_arrays(arrays: &[ArrayRef], indices: &[(usize, usize)]) -> Result<ArrayRef> {
    let values: Vec<&dyn Array> = arrays.iter().map(|a| a.as_ref()).collect();
    Ok(interleave(&values, indices)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{set_group_metadata, set_time_column, GroupDescriptor};
    use arrow::array::{Float64Array, StringArray, TimestampNanosecondArray, TimestampSecondArray};

    fn source(times: Vec<i64>, tags: Vec<&str>, field: &str, values: Vec<f64>) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("time", DataType::Timestamp(TimeUnit::Second, None), false),
            Field::new("tag", DataType::Utf8, false),
            Field::new(field, DataType::Float64, true),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(TimestampSecondArray::from(times)),
                Arc::new(StringArray::from(tags)),
                Arc::new(Float64Array::from(values)),
            ],
        )
        .unwrap();
        set_time_column(batch, "time").unwrap()
    }

    fn handler(tolerance_secs: u64) -> JoinHandler {
        JoinHandler::new(
            JoinOptions::new(vec!["tag".to_string()])
                .with_tolerance(Duration::from_secs(tolerance_secs)),
        )
        .unwrap()
    }

    fn floats(batch: &RecordBatch, name: &str) -> Vec<Option<f64>> {
        batch
            .column_by_name(name)
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap()
            .iter()
            .collect()
    }

    fn seconds(batch: &RecordBatch) -> Vec<i64> {
        batch
            .column_by_name("time")
            .unwrap()
            .as_any()
            .downcast_ref::<TimestampSecondArray>()
            .unwrap()
            .values()
            .to_vec()
    }

    #[test]
    fn test_empty_join_keys() {
        let err = JoinHandler::new(JoinOptions::new(vec![])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_no_batches() {
        let err = handler(0).handle_batches(vec![]).unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
    }

    #[test]
    fn test_tie_break_earliest_row_then_lowest_source() {
        // Sources 0 and 1 both open rows at t=100; source 2 at t=101 can merge
        // into either and must pick the earliest-opened one.
        let a = source(vec![100, 100], vec!["t", "t"], "a", vec![1.0, 2.0]);
        let b = source(vec![101], vec!["t"], "b", vec![3.0]);
        let c = source(vec![101], vec!["t"], "c", vec![4.0]);

        let out = handler(5).handle_batches(vec![a, b, c]).unwrap();
        let batch = &out[0];
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(seconds(batch), vec![100, 100]);
        assert_eq!(floats(batch, "a"), vec![Some(1.0), Some(2.0)]);
        assert_eq!(floats(batch, "b"), vec![Some(3.0), None]);
        assert_eq!(floats(batch, "c"), vec![Some(4.0), None]);
    }

    #[test]
    fn test_lowest_source_wins_shared_field() {
        let a = source(vec![100], vec!["t"], "v", vec![1.0]);
        let b = source(vec![100], vec!["t"], "v", vec![2.0]);

        let out = handler(0).handle_batches(vec![a, b]).unwrap();
        assert_eq!(floats(&out[0], "v"), vec![Some(1.0)]);
    }

    #[test]
    fn test_rows_close_past_tolerance() {
        let a = source(vec![100], vec!["t"], "a", vec![1.0]);
        let b = source(vec![106], vec!["t"], "b", vec![2.0]);

        let out = handler(5).handle_batches(vec![a, b]).unwrap();
        assert_eq!(out[0].num_rows(), 2);
        assert_eq!(seconds(&out[0]), vec![100, 106]);
    }

    #[test]
    fn test_mixed_time_units() {
        let a = source(vec![100], vec!["t"], "a", vec![1.0]);

        let schema = Schema::new(vec![
            Field::new("ts", DataType::Timestamp(TimeUnit::Nanosecond, None), false),
            Field::new("tag", DataType::Utf8, false),
            Field::new("b", DataType::Float64, true),
        ]);
        let b = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(TimestampNanosecondArray::from(vec![100_000_000_000])),
                Arc::new(StringArray::from(vec!["t"])),
                Arc::new(Float64Array::from(vec![2.0])),
            ],
        )
        .unwrap();
        let b = set_time_column(b, "ts").unwrap();

        let out = handler(0).handle_batches(vec![a, b]).unwrap();
        let batch = &out[0];
        assert_eq!(batch.num_rows(), 1);
        assert!(batch.column_by_name("ts").is_none());
        assert_eq!(floats(batch, "b"), vec![Some(2.0)]);
    }

    #[test]
    fn test_key_type_mismatch() {
        let a = source(vec![100], vec!["t"], "a", vec![1.0]);
        let schema = Schema::new(vec![
            Field::new("time", DataType::Timestamp(TimeUnit::Second, None), false),
            Field::new("tag", DataType::Float64, false),
        ]);
        let b = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(TimestampSecondArray::from(vec![100])),
                Arc::new(Float64Array::from(vec![1.0])),
            ],
        )
        .unwrap();
        let b = set_time_column(b, "time").unwrap();

        let err = handler(0).handle_batches(vec![a, b]).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
    }

    #[test]
    fn test_field_named_like_output_time_column() {
        let a = source(vec![100], vec!["t"], "a", vec![1.0]);
        let schema = Schema::new(vec![
            Field::new("ts", DataType::Timestamp(TimeUnit::Second, None), false),
            Field::new("tag", DataType::Utf8, false),
            Field::new("time", DataType::Float64, true),
        ]);
        let b = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(TimestampSecondArray::from(vec![100])),
                Arc::new(StringArray::from(vec!["t"])),
                Arc::new(Float64Array::from(vec![2.0])),
            ],
        )
        .unwrap();
        let b = set_time_column(b, "ts").unwrap();

        let err = handler(0).handle_batches(vec![a, b]).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_missing_time_metadata() {
        let a = source(vec![100], vec!["t"], "a", vec![1.0]);
        let schema = a.schema_ref().as_ref().clone().with_metadata(Default::default());
        let bare = RecordBatch::try_new(Arc::new(schema), a.columns().to_vec()).unwrap();

        let err = handler(0).handle_batches(vec![a, bare]).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_group_descriptor_kept_only_when_shared() {
        let group = GroupDescriptor::new().with("tag", Some("t"));
        let a = set_group_metadata(source(vec![100], vec!["t"], "a", vec![1.0]), &group).unwrap();
        let b = set_group_metadata(source(vec![100], vec!["t"], "b", vec![2.0]), &group).unwrap();

        let out = handler(0).handle_batches(vec![a.clone(), b]).unwrap();
        assert_eq!(extract_group_metadata(&out[0]).unwrap(), Some(group));

        let c = source(vec![100], vec!["t"], "c", vec![3.0]);
        let out = handler(0).handle_batches(vec![a, c]).unwrap();
        assert_eq!(extract_group_metadata(&out[0]).unwrap(), None);
    }
}
