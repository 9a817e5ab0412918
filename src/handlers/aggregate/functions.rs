//! Aggregate function library
//!
//! Each function folds a whole column into a single-element array.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{new_null_array, Array, ArrayRef, AsArray, Float64Array, Int64Array, UInt64Array};
use arrow::compute::{cast, sort_to_indices, sum_checked, SortOptions};
use arrow::datatypes::{DataType, Float64Type, Int64Type, UInt64Type};
use serde::{Deserialize, Serialize};

use super::numeric::{KahanSum, WelfordMean};
use crate::error::{Error, Result};

/// Fold applied to a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    /// First non-null value
    First,
    /// Last non-null value
    Last,
    Min,
    Max,
    Sum,
    Mean,
    /// Number of non-null values
    Count,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::First => "first",
            AggregateFunction::Last => "last",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Mean => "mean",
            AggregateFunction::Count => "count",
        }
    }

    /// Whether the function picks one of the input values unchanged
    pub fn is_selector(&self) -> bool {
        matches!(
            self,
            AggregateFunction::First
                | AggregateFunction::Last
                | AggregateFunction::Min
                | AggregateFunction::Max
        )
    }

    /// Type of the single-row result for an input of `input` type
    pub fn output_type(&self, input: &DataType) -> Result<DataType> {
        match self {
            AggregateFunction::First
            | AggregateFunction::Last
            | AggregateFunction::Min
            | AggregateFunction::Max => Ok(input.clone()),
            AggregateFunction::Count => Ok(DataType::Int64),
            AggregateFunction::Mean if input.is_numeric() => Ok(DataType::Float64),
            AggregateFunction::Sum if input.is_signed_integer() => Ok(DataType::Int64),
            AggregateFunction::Sum if input.is_unsigned_integer() => Ok(DataType::UInt64),
            AggregateFunction::Sum if input.is_floating() => Ok(DataType::Float64),
            _ => Err(Error::type_error(format!(
                "{} is not defined for columns of type {}",
                self, input
            ))),
        }
    }

    /// Fold `array` into a single-row array
    pub fn evaluate(&self, array: &ArrayRef) -> Result<ArrayRef> {
        let output_type = self.output_type(array.data_type())?;
        let all_null = array.null_count() == array.len();

        if all_null && *self != AggregateFunction::Count {
            return Ok(new_null_array(&output_type, 1));
        }

        match self {
            AggregateFunction::First => {
                let index = (0..array.len()).find(|&i| array.is_valid(i)).unwrap_or(0);
                Ok(array.slice(index, 1))
            }
            AggregateFunction::Last => {
                let index = (0..array.len()).rev().find(|&i| array.is_valid(i)).unwrap_or(0);
                Ok(array.slice(index, 1))
            }
            AggregateFunction::Min => select_extreme(array, false),
            AggregateFunction::Max => select_extreme(array, true),
            AggregateFunction::Count => {
                let count = (array.len() - array.null_count()) as i64;
                Ok(Arc::new(Int64Array::from(vec![count])))
            }
            AggregateFunction::Sum => match output_type {
                DataType::Int64 => {
                    let values = cast(array, &DataType::Int64)?;
                    let sum = sum_checked(values.as_primitive::<Int64Type>())?;
                    Ok(Arc::new(Int64Array::from(vec![sum])))
                }
                DataType::UInt64 => {
                    let values = cast(array, &DataType::UInt64)?;
                    let sum = sum_checked(values.as_primitive::<UInt64Type>())?;
                    Ok(Arc::new(UInt64Array::from(vec![sum])))
                }
                _ => {
                    let values = cast(array, &DataType::Float64)?;
                    let mut kahan = KahanSum::new();
                    values
                        .as_primitive::<Float64Type>()
                        .iter()
                        .flatten()
                        .for_each(|v| kahan.add(v));
                    Ok(Arc::new(Float64Array::from(vec![kahan.sum()])))
                }
            },
            AggregateFunction::Mean => {
                let values = cast(array, &DataType::Float64)?;
                let mut welford = WelfordMean::new();
                values
                    .as_primitive::<Float64Type>()
                    .iter()
                    .flatten()
                    .for_each(|v| welford.add(v));
                Ok(Arc::new(Float64Array::from(vec![welford.mean()])))
            }
        }
    }
}

/// Smallest or largest non-null value, keeping the input type
fn select_extreme(array: &ArrayRef, largest: bool) -> Result<ArrayRef> {
    let options = SortOptions {
        descending: largest,
        nulls_first: false,
    };
    let indices = sort_to_indices(array, Some(options), Some(1))?;
    Ok(array.slice(indices.value(0) as usize, 1))
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(AggregateFunction::First),
            "last" => Ok(AggregateFunction::Last),
            "min" => Ok(AggregateFunction::Min),
            "max" => Ok(AggregateFunction::Max),
            "sum" => Ok(AggregateFunction::Sum),
            "mean" => Ok(AggregateFunction::Mean),
            "count" => Ok(AggregateFunction::Count),
            other => Err(Error::config(format!("unknown aggregate function: {}", other))),
        }
    }
}
