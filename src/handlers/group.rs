//! Group handler for partitioning batches by column values
//!
//! Splits each input batch into one batch per distinct tuple of the grouping
//! columns and stamps every output with its group descriptor.
//!
//! # Example
//!
//! ```rust,ignore
//! use kuba_stream::handlers::{GroupHandler, RecordBatchHandler};
//!
//! let mut handler = GroupHandler::new(vec!["host".to_string()])?;
//! let groups = handler.handle(batch)?;
//! ```

use std::collections::HashMap;

use arrow::array::{ArrayRef, RecordBatch, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::row::{RowConverter, SortField};
use tracing::debug;

use super::RecordBatchHandler;
use crate::error::{Error, Result};
use crate::metadata::fill_group_metadata;
use crate::metadata::grouping::canonical_group_keys;

/// Handler that partitions rows by the values of a set of columns
///
/// Partitions are emitted in order of first appearance and rows keep their
/// relative input order. Null is a group value of its own. Float keys compare
/// by value, so `0.0` and `-0.0` share a partition, and all NaNs form one.
#[derive(Debug, Clone)]
pub struct GroupHandler {
    /// Grouping columns, in configured order
    columns: Vec<String>,
}

impl GroupHandler {
    /// Create a handler grouping by `columns`
    ///
    /// Returns `Config` if the list is empty.
    pub fn new(columns: Vec<String>) -> Result<Self> {
        if columns.is_empty() {
            return Err(Error::config("group handler needs at least one column"));
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Row indices of each partition, in first-appearance order
    fn partition(&self, batch: &RecordBatch) -> Result<Vec<Vec<u32>>> {
        let arrays: Vec<ArrayRef> = self
            .columns
            .iter()
            .map(|name| {
                batch
                    .column_by_name(name)
                    .map(canonical_group_keys)
                    .ok_or_else(|| Error::schema(format!("no such group column: {}", name)))
            })
            .collect::<Result<_>>()?;

        let converter = RowConverter::new(
            arrays
                .iter()
                .map(|array| SortField::new(array.data_type().clone()))
                .collect(),
        )?;
        let rows = converter.convert_columns(&arrays)?;

        let mut slots = HashMap::new();
        let mut partitions: Vec<Vec<u32>> = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            let slot = *slots.entry(row).or_insert_with(|| {
                partitions.push(Vec::new());
                partitions.len() - 1
            });
            partitions[slot].push(i as u32);
        }

        Ok(partitions)
    }
}

impl RecordBatchHandler for GroupHandler {
    fn handle(&mut self, batch: RecordBatch) -> Result<Vec<RecordBatch>> {
        if batch.num_rows() == 0 {
            return Ok(Vec::new());
        }

        let partitions = self.partition(&batch)?;
        debug!(
            "Grouping {} rows by {:?} into {} partitions",
            batch.num_rows(),
            self.columns,
            partitions.len()
        );

        if partitions.len() == 1 {
            return Ok(vec![fill_group_metadata(batch, &self.columns)?]);
        }

        partitions
            .into_iter()
            .map(|indices| {
                let part = take_record_batch(&batch, &UInt32Array::from(indices))?;
                fill_group_metadata(part, &self.columns)
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "group"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{extract_group_metadata, GroupDescriptor};
    use arrow::array::{Array, Float64Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn batch(hosts: Vec<Option<&str>>, values: Vec<i64>) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("host", DataType::Utf8, true),
            Field::new("value", DataType::Int64, false),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(hosts)),
                Arc::new(Int64Array::from(values)),
            ],
        )
        .unwrap()
    }

    fn values(batch: &RecordBatch) -> Vec<i64> {
        batch
            .column_by_name("value")
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .values()
            .to_vec()
    }

    #[test]
    fn test_empty_column_list() {
        assert!(matches!(GroupHandler::new(vec![]), Err(Error::Config(_))));
    }

    #[test]
    fn test_partitions_in_first_appearance_order() {
        let mut handler = GroupHandler::new(vec!["host".to_string()]).unwrap();
        let input = batch(
            vec![Some("b"), Some("a"), Some("b"), None, Some(""), Some("a")],
            vec![1, 2, 3, 4, 5, 6],
        );

        let out = handler.handle(input).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(values(&out[0]), vec![1, 3]);
        assert_eq!(values(&out[1]), vec![2, 6]);
        assert_eq!(values(&out[2]), vec![4]);
        assert_eq!(values(&out[3]), vec![5]);

        assert_eq!(
            extract_group_metadata(&out[2]).unwrap(),
            Some(GroupDescriptor::new().with("host", None))
        );
        assert_eq!(
            extract_group_metadata(&out[3]).unwrap(),
            Some(GroupDescriptor::new().with("host", Some("")))
        );
    }

    #[test]
    fn test_descriptor_matches_every_row() {
        let mut handler = GroupHandler::new(vec!["host".to_string()]).unwrap();
        let out = handler
            .handle(batch(vec![Some("x"), Some("y"), Some("x")], vec![1, 2, 3]))
            .unwrap();

        for part in &out {
            let descriptor = extract_group_metadata(part).unwrap().unwrap();
            let expected = descriptor.get("host").unwrap();
            let hosts = part
                .column_by_name("host")
                .unwrap()
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap();
            for i in 0..hosts.len() {
                assert_eq!(Some(hosts.value(i)), expected);
            }
        }
    }

    #[test]
    fn test_single_partition_is_passthrough() {
        let mut handler = GroupHandler::new(vec!["host".to_string()]).unwrap();
        let input = batch(vec![Some("a"), Some("a")], vec![1, 2]);
        let column = input.column(1).clone();

        let out = handler.handle(input).unwrap();
        assert_eq!(out.len(), 1);
        assert!(Arc::ptr_eq(out[0].column(1), &column));
    }

    #[test]
    fn test_regrouping_is_stable() {
        let mut handler = GroupHandler::new(vec!["host".to_string()]).unwrap();
        let first = handler
            .handle(batch(vec![Some("a"), Some("b")], vec![1, 2]))
            .unwrap();
        let second = handler.handle_batches(first.clone()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_float_keys_use_value_equality() {
        let schema = Schema::new(vec![
            Field::new("v", DataType::Float64, true),
            Field::new("value", DataType::Int64, false),
        ]);
        let input = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Float64Array::from(vec![-0.0, 0.0, f64::NAN, -f64::NAN, 1.5])),
                Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5])),
            ],
        )
        .unwrap();

        let mut handler = GroupHandler::new(vec!["v".to_string()]).unwrap();
        let out = handler.handle(input).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(values(&out[0]), vec![1, 2]);
        assert_eq!(values(&out[1]), vec![3, 4]);
        assert_eq!(values(&out[2]), vec![5]);

        let descriptors: Vec<GroupDescriptor> = out
            .iter()
            .map(|b| extract_group_metadata(b).unwrap().unwrap())
            .collect();
        assert_eq!(descriptors[0], GroupDescriptor::new().with("v", Some("0.0")));
        assert_eq!(descriptors[1], GroupDescriptor::new().with("v", Some("NaN")));
        assert_eq!(descriptors[2], GroupDescriptor::new().with("v", Some("1.5")));
    }

    #[test]
    fn test_empty_batch_and_missing_column() {
        let mut handler = GroupHandler::new(vec!["host".to_string()]).unwrap();
        assert!(handler.handle(batch(vec![], vec![])).unwrap().is_empty());

        let mut handler = GroupHandler::new(vec!["dc".to_string()]).unwrap();
        let err = handler.handle(batch(vec![Some("a")], vec![1])).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
