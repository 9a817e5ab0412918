//! Sort handler for ordering rows within a batch
//!
//! Rows are ordered ascending by each configured column in turn, with nulls
//! last. Rows that compare equal keep their input order.
//!
//! # Example
//!
//! ```rust,ignore
//! use kuba_stream::handlers::{RecordBatchHandler, SortHandler};
//!
//! // Sort by host, then by time
//! let mut handler = SortHandler::new(vec!["host".to_string(), "time".to_string()])?;
//! let sorted = handler.handle(batch)?;
//! ```

use arrow::array::{ArrayRef, RecordBatch, UInt32Array};
use arrow::compute::{take_record_batch, SortOptions};
use arrow::row::{RowConverter, SortField};
use tracing::debug;

use super::RecordBatchHandler;
use crate::error::{Error, Result};

/// Handler that sorts each batch by a list of columns
#[derive(Debug, Clone)]
pub struct SortHandler {
    /// Sort keys, most significant first
    columns: Vec<String>,
}

impl SortHandler {
    /// Create a sort handler
    ///
    /// Returns `Config` if the column list is empty.
    pub fn new(columns: Vec<String>) -> Result<Self> {
        if columns.is_empty() {
            return Err(Error::config("sort handler needs at least one column"));
        }
        Ok(Self { columns })
    }

    /// Stable sort permutation of `batch`
    fn sort_indices(&self, batch: &RecordBatch) -> Result<Vec<u32>> {
        let options = SortOptions {
            descending: false,
            nulls_first: false,
        };

        let arrays: Vec<ArrayRef> = self
            .columns
            .iter()
            .map(|name| {
                batch
                    .column_by_name(name)
                    .cloned()
                    .ok_or_else(|| Error::schema(format!("no such sort column: {}", name)))
            })
            .collect::<Result<_>>()?;

        let converter = RowConverter::new(
            arrays
                .iter()
                .map(|array| SortField::new_with_options(array.data_type().clone(), options))
                .collect(),
        )?;
        let rows = converter.convert_columns(&arrays)?;

        // Vec::sort_by is stable, so equal keys keep their input order
        let mut indices: Vec<u32> = (0..batch.num_rows() as u32).collect();
        indices.sort_by(|&a, &b| rows.row(a as usize).cmp(&rows.row(b as usize)));
        Ok(indices)
    }
}

impl RecordBatchHandler for SortHandler {
    fn handle(&mut self, batch: RecordBatch) -> Result<Vec<RecordBatch>> {
        let indices = self.sort_indices(&batch)?;
        if indices.windows(2).all(|w| w[0] < w[1]) {
            return Ok(vec![batch]);
        }

        debug!("Sorting {} rows by {:?}", batch.num_rows(), self.columns);
        let sorted = take_record_batch(&batch, &UInt32Array::from(indices))?;
        Ok(vec![sorted])
    }

    fn name(&self) -> &'static str {
        "sort"
    }
}
