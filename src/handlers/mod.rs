//! Record batch handlers
//!
//! This module provides the transformation stages of the engine:
//! - Group handler for partitioning batches by column values
//! - Join handler for merging sources on keys within a time tolerance
//! - Aggregate handler for folding each batch into one row per group
//! - Threshold state machine for adaptive, event-time driven alert limits
//! - Sort and default handlers for shaping batches
//!
//! Every handler consumes batches by value and returns new batches. A failed
//! call returns an error and no output.

pub mod aggregate;
pub mod default;
pub mod group;
pub mod join;
pub mod sort;
pub mod threshold;

use std::collections::HashMap;

use arrow::array::RecordBatch;
use tracing::debug;

use crate::error::Result;
use crate::metadata::{extract_group_metadata, GroupDescriptor};

// Re-export commonly used types
pub use aggregate::{AggregateFunction, AggregateHandler, AggregateOptions, AggregateSpec, TimeAggregateRule};
pub use default::{DefaultHandler, DefaultValue};
pub use group::GroupHandler;
pub use join::{JoinHandler, JoinOptions};
pub use sort::SortHandler;
pub use threshold::{
    ThresholdOptions, ThresholdState, ThresholdStateMachine, ThresholdStateMachineFactory,
};

// ============================================================================
// Handler Traits
// ============================================================================

/// A transformation stage over record batches
///
/// `handle` is the unit of work. `handle_batches` applies it to each batch
/// and concatenates the results in input order; handlers whose semantics span
/// several batches override it.
pub trait RecordBatchHandler: Send {
    /// Transform one batch
    fn handle(&mut self, batch: RecordBatch) -> Result<Vec<RecordBatch>>;

    /// Transform a batch set
    fn handle_batches(&mut self, batches: Vec<RecordBatch>) -> Result<Vec<RecordBatch>> {
        let mut output = Vec::with_capacity(batches.len());
        for batch in batches {
            output.extend(self.handle(batch)?);
        }
        Ok(output)
    }

    /// Handler name for logging
    fn name(&self) -> &'static str;
}

/// Produces fresh, independent handler instances
pub trait HandlerFactory: Send + Sync {
    fn create_handler(&self) -> Box<dyn RecordBatchHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn RecordBatchHandler> + Send + Sync,
{
    fn create_handler(&self) -> Box<dyn RecordBatchHandler> {
        self()
    }
}

/// A handler with private state that can be persisted and duplicated
pub trait StatefulHandler: RecordBatchHandler {
    /// Serialize exactly the state needed to resume identical behavior
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the current state with a snapshot
    ///
    /// An empty or malformed snapshot is an error and leaves the state as is.
    fn restore(&mut self, snapshot: &[u8]) -> Result<()>;

    /// An independent copy carrying the same state
    fn clone_boxed(&self) -> Box<dyn StatefulHandler>;
}

// ============================================================================
// Per-Group Routing
// ============================================================================

/// Routes each batch to a handler instance owned by its group descriptor
///
/// Instances are created from the factory on first sight of a descriptor.
/// Ungrouped batches share a single instance.
pub struct PerGroupHandler {
    factory: Box<dyn HandlerFactory>,
    instances: HashMap<Option<GroupDescriptor>, Box<dyn RecordBatchHandler>>,
}

impl PerGroupHandler {
    pub fn new(factory: Box<dyn HandlerFactory>) -> Self {
        Self {
            factory,
            instances: HashMap::new(),
        }
    }

    /// Number of instances created so far
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

impl RecordBatchHandler for PerGroupHandler {
    fn handle(&mut self, batch: RecordBatch) -> Result<Vec<RecordBatch>> {
        let key = extract_group_metadata(&batch)?;
        let factory = &self.factory;
        let instance = self.instances.entry(key).or_insert_with_key(|key| {
            match key {
                Some(descriptor) => debug!("Creating handler instance for group {}", descriptor),
                None => debug!("Creating handler instance for ungrouped batches"),
            }
            factory.create_handler()
        });
        instance.handle(batch)
    }

    fn name(&self) -> &'static str {
        "per_group"
    }
}
