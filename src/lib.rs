//! kuba-stream - Record batch transformation engine for streaming metrics
//!
//! This library transforms columnar batches of time-series points with:
//! - A typed metadata model for time, measurement and group columns
//! - Grouping by column values
//! - Multi-source joins within an event-time tolerance
//! - Per-group aggregation with numerically stable folds
//! - Adaptive thresholds driven by a hysteresis state machine
//!
//! Batches are Apache Arrow `RecordBatch` values. Handlers are chained into a
//! [`Pipeline`](pipeline::Pipeline) described by a TOML configuration.

#![warn(clippy::all)]

pub mod error;

/// Column roles, time and measurement accessors, group descriptors
pub mod metadata;

/// Transformation stages and the handler composition traits
pub mod handlers;

/// Conversion between point lists and record batches
pub mod points;

/// Ordered handler chains
pub mod pipeline;

/// Configuration management with TOML support
pub mod config;

// Re-export main types
pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use handlers::{HandlerFactory, PerGroupHandler, RecordBatchHandler, StatefulHandler};
pub use pipeline::Pipeline;
pub use points::{FieldValue, Point, PointsConverter};
