//! Adaptive threshold state machine
//!
//! Tracks a watched value against a threshold that adapts with hysteresis:
//! the threshold only moves after the value has stayed past a trigger for a
//! configured duration. Durations are measured in event time taken from the
//! batch's time column, never wall-clock time, so replaying the same data
//! always yields the same thresholds.
//!
//! # States
//!
//! | State      | Leaves when                                   | Goes to |
//! |------------|-----------------------------------------------|---------|
//! | `Ok`       | value > threshold                             | `Increase` |
//! | `Ok`       | value < threshold * decrease trigger          | `Decrease` |
//! | `Increase` | value <= threshold (threshold unchanged)      | `Ok` |
//! | `Increase` | window >= increase_after (threshold scaled up) | `Ok` |
//! | `Decrease` | value >= threshold * decrease trigger         | `Ok` |
//! | `Decrease` | window >= decrease_after (threshold scaled down) | `Ok` |
//!
//! Each instance owns its state. Use [`ThresholdStateMachineFactory`] with a
//! [`PerGroupHandler`](super::PerGroupHandler) to keep one instance per group.

use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, RecordBatch};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Schema};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{HandlerFactory, RecordBatchHandler, StatefulHandler};
use crate::error::{Error, Result};
use crate::metadata::{event_times, with_column_type, ColumnType};

/// State of the threshold machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdState {
    Ok,
    /// Value above the threshold, waiting for the increase window
    Increase,
    /// Value below the decrease trigger, waiting for the decrease window
    Decrease,
}

/// Threshold machine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdOptions {
    /// Column holding the watched value
    pub watch_column: String,
    /// Column the threshold is written to
    pub threshold_column: String,
    /// Initial threshold
    pub default_threshold: f64,
    pub increase_scale_factor: f64,
    pub increase_after: Duration,
    /// Fraction of the threshold below which a decrease starts; `<= 0` disables
    pub decrease_trigger_factor: f64,
    pub decrease_scale_factor: f64,
    pub decrease_after: Duration,
    /// Floor for decreases
    pub min_threshold: Option<f64>,
    /// Ceiling for increases
    pub max_threshold: Option<f64>,
}

impl ThresholdOptions {
    pub fn new(
        watch_column: impl Into<String>,
        threshold_column: impl Into<String>,
        default_threshold: f64,
    ) -> Self {
        Self {
            watch_column: watch_column.into(),
            threshold_column: threshold_column.into(),
            default_threshold,
            increase_scale_factor: 1.0,
            increase_after: Duration::ZERO,
            decrease_trigger_factor: 0.0,
            decrease_scale_factor: 1.0,
            decrease_after: Duration::ZERO,
            min_threshold: None,
            max_threshold: None,
        }
    }

    pub fn with_increase(mut self, scale_factor: f64, after: Duration) -> Self {
        self.increase_scale_factor = scale_factor;
        self.increase_after = after;
        self
    }

    pub fn with_decrease(mut self, trigger_factor: f64, scale_factor: f64, after: Duration) -> Self {
        self.decrease_trigger_factor = trigger_factor;
        self.decrease_scale_factor = scale_factor;
        self.decrease_after = after;
        self
    }

    pub fn with_min_threshold(mut self, min: f64) -> Self {
        self.min_threshold = Some(min);
        self
    }

    pub fn with_max_threshold(mut self, max: f64) -> Self {
        self.max_threshold = Some(max);
        self
    }

    /// Check the options for consistency
    pub fn validate(&self) -> Result<()> {
        if self.watch_column.is_empty() || self.threshold_column.is_empty() {
            return Err(Error::config("watch and threshold column names must not be empty"));
        }
        if self.watch_column == self.threshold_column {
            return Err(Error::config("threshold column must differ from the watch column"));
        }
        if !self.default_threshold.is_finite() {
            return Err(Error::config("default threshold must be finite"));
        }
        if !(self.increase_scale_factor.is_finite() && self.increase_scale_factor > 0.0) {
            return Err(Error::config("increase scale factor must be positive"));
        }
        if !(self.decrease_scale_factor.is_finite() && self.decrease_scale_factor > 0.0) {
            return Err(Error::config("decrease scale factor must be positive"));
        }
        if let (Some(min), Some(max)) = (self.min_threshold, self.max_threshold) {
            if min > max {
                return Err(Error::config(format!(
                    "min threshold {} exceeds max threshold {}",
                    min, max
                )));
            }
        }
        Ok(())
    }

    fn decrease_enabled(&self) -> bool {
        self.decrease_trigger_factor > 0.0
    }
}

/// Mutable part of the machine, also the snapshot format
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct MachineState {
    state: ThresholdState,
    threshold: f64,
    /// Event time (ns) the current Increase/Decrease window opened
    window_start: Option<i64>,
}

/// Stateful handler appending an adaptive threshold column
#[derive(Debug, Clone)]
pub struct ThresholdStateMachine {
    options: ThresholdOptions,
    current: MachineState,
}

impl ThresholdStateMachine {
    /// Create a machine in state `Ok` at the default threshold
    pub fn new(options: ThresholdOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::from_validated(options))
    }

    fn from_validated(options: ThresholdOptions) -> Self {
        let current = MachineState {
            state: ThresholdState::Ok,
            threshold: options.default_threshold,
            window_start: None,
        };
        Self { options, current }
    }

    pub fn state(&self) -> ThresholdState {
        self.current.state
    }

    pub fn threshold(&self) -> f64 {
        self.current.threshold
    }

    pub fn options(&self) -> &ThresholdOptions {
        &self.options
    }

    /// Advance `machine` by one observation and return the threshold in effect
    fn step(options: &ThresholdOptions, machine: &mut MachineState, value: f64, time: i64) -> f64 {
        let before = machine.state;

        match machine.state {
            ThresholdState::Ok => {
                if value > machine.threshold {
                    machine.state = ThresholdState::Increase;
                    machine.window_start = Some(time);
                } else if options.decrease_enabled()
                    && value < machine.threshold * options.decrease_trigger_factor
                {
                    machine.state = ThresholdState::Decrease;
                    machine.window_start = Some(time);
                }
            }
            ThresholdState::Increase => {
                if value > machine.threshold {
                    if window_elapsed(machine.window_start, time, options.increase_after) {
                        let mut next = machine.threshold * options.increase_scale_factor;
                        if let Some(max) = options.max_threshold {
                            next = next.min(max);
                        }
                        machine.threshold = next;
                        machine.state = ThresholdState::Ok;
                        machine.window_start = None;
                    }
                } else {
                    machine.state = ThresholdState::Ok;
                    machine.window_start = None;
                }
            }
            ThresholdState::Decrease => {
                if value < machine.threshold * options.decrease_trigger_factor {
                    if window_elapsed(machine.window_start, time, options.decrease_after) {
                        let mut next = machine.threshold * options.decrease_scale_factor;
                        if let Some(min) = options.min_threshold {
                            next = next.max(min);
                        }
                        machine.threshold = next;
                        machine.state = ThresholdState::Ok;
                        machine.window_start = None;
                    }
                } else {
                    machine.state = ThresholdState::Ok;
                    machine.window_start = None;
                }
            }
        }

        if machine.state != before {
            debug!(
                "Threshold on {} moved {:?} -> {:?} at {} (value {}, threshold {})",
                options.watch_column, before, machine.state, time, value, machine.threshold
            );
        }

        machine.threshold
    }

    fn watch_values(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let column = batch.column_by_name(&self.options.watch_column).ok_or_else(|| {
            Error::schema(format!("no such watch column: {}", self.options.watch_column))
        })?;
        if !column.data_type().is_numeric() {
            return Err(Error::type_error(format!(
                "watch column {} must be numeric, got {}",
                self.options.watch_column,
                column.data_type()
            )));
        }
        Ok(cast(column, &DataType::Float64)?)
    }

    /// Append the threshold column, replacing one of the same name
    fn attach(&self, batch: RecordBatch, thresholds: Vec<f64>) -> Result<RecordBatch> {
        let field = with_column_type(
            &Field::new(&self.options.threshold_column, DataType::Float64, false),
            ColumnType::Field,
        );
        let column: ArrayRef = Arc::new(Float64Array::from(thresholds));

        let schema = batch.schema();
        let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
        let mut columns = batch.columns().to_vec();

        match schema.index_of(&self.options.threshold_column) {
            Ok(index) => {
                fields[index] = field;
                columns[index] = column;
            }
            Err(_) => {
                fields.push(field);
                columns.push(column);
            }
        }

        let schema = Schema::new_with_metadata(fields, schema.metadata().clone());
        Ok(RecordBatch::try_new(Arc::new(schema), columns)?)
    }
}

/// Whether at least `after` has passed since `start`
fn window_elapsed(start: Option<i64>, now: i64, after: Duration) -> bool {
    let after = i64::try_from(after.as_nanos()).unwrap_or(i64::MAX);
    match start {
        Some(start) => now.saturating_sub(start) >= after,
        None => true,
    }
}

impl RecordBatchHandler for ThresholdStateMachine {
    fn handle(&mut self, batch: RecordBatch) -> Result<Vec<RecordBatch>> {
        let values = self.watch_values(&batch)?;
        let values = values.as_primitive::<Float64Type>();
        let times = event_times(&batch)?;

        // Work on a copy so a failure leaves the machine untouched.
        let mut machine = self.current;
        let mut thresholds = Vec::with_capacity(batch.num_rows());
        for (row, time) in times.into_iter().enumerate() {
            let time = time.ok_or_else(|| Error::schema(format!("null event time at row {}", row)))?;
            // NaN carries no reading, same as null.
            if values.is_null(row) || values.value(row).is_nan() {
                thresholds.push(machine.threshold);
                continue;
            }
            thresholds.push(Self::step(&self.options, &mut machine, values.value(row), time));
        }

        let output = self.attach(batch, thresholds)?;
        self.current = machine;
        Ok(vec![output])
    }

    fn name(&self) -> &'static str {
        "threshold"
    }
}

impl StatefulHandler for ThresholdStateMachine {
    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.current)?)
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        if snapshot.is_empty() {
            return Err(Error::restore("empty threshold snapshot"));
        }
        let restored: MachineState = serde_json::from_slice(snapshot)
            .map_err(|e| Error::restore(format!("malformed threshold snapshot: {}", e)))?;
        if !restored.threshold.is_finite() {
            return Err(Error::restore("snapshot threshold is not finite"));
        }
        if restored.state != ThresholdState::Ok && restored.window_start.is_none() {
            return Err(Error::restore(format!(
                "snapshot in state {:?} has no window start",
                restored.state
            )));
        }
        self.current = restored;
        Ok(())
    }

    fn clone_boxed(&self) -> Box<dyn StatefulHandler> {
        Box::new(self.clone())
    }
}

/// Creates fresh threshold machines sharing one configuration
#[derive(Debug, Clone)]
pub struct ThresholdStateMachineFactory {
    options: ThresholdOptions,
}

impl ThresholdStateMachineFactory {
    pub fn new(options: ThresholdOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }
}

impl HandlerFactory for ThresholdStateMachineFactory {
    fn create_handler(&self) -> Box<dyn RecordBatchHandler> {
        Box::new(ThresholdStateMachine::from_validated(self.options.clone()))
    }
}
