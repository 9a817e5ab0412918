//! Ordered chain of handlers
//!
//! The output batch set of each stage is the input of the next. An error in
//! any stage aborts the whole call.

use arrow::array::RecordBatch;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::handlers::RecordBatchHandler;

/// A sequence of handlers run in order
pub struct Pipeline {
    stages: Vec<Box<dyn RecordBatchHandler>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn RecordBatchHandler>>) -> Self {
        Self { stages }
    }

    /// Build every configured handler, in order
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let stages = config
            .handlers
            .iter()
            .map(|handler| handler.build())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(stages))
    }

    /// Stage names, in execution order
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `batches` through every stage
    pub fn handle(&mut self, batches: Vec<RecordBatch>) -> Result<Vec<RecordBatch>> {
        let mut current = batches;
        for (index, stage) in self.stages.iter_mut().enumerate() {
            let input = current.len();
            current = stage.handle_batches(current).map_err(|e| {
                warn!("Stage {} ({}) failed: {}", index, stage.name(), e);
                e
            })?;
            debug!(
                "Stage {} ({}) turned {} batches into {}",
                index,
                stage.name(),
                input,
                current.len()
            );
        }
        Ok(current)
    }
}

impl RecordBatchHandler for Pipeline {
    fn handle(&mut self, batch: RecordBatch) -> Result<Vec<RecordBatch>> {
        Pipeline::handle(self, vec![batch])
    }

    fn handle_batches(&mut self, batches: Vec<RecordBatch>) -> Result<Vec<RecordBatch>> {
        Pipeline::handle(self, batches)
    }

    fn name(&self) -> &'static str {
        "pipeline"
    }
}
