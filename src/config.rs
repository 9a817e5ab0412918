//! Configuration management for kuba-stream
//!
//! A pipeline is described in TOML: logging, the point conversion column
//! names and an ordered list of handlers. Environment variables override a
//! subset of the settings.
//!
//! ```toml
//! [logging]
//! level = "debug"
//!
//! [[handlers]]
//! type = "group"
//! columns = ["host"]
//!
//! [[handlers]]
//! type = "threshold"
//! watch_column = "usage"
//! threshold_column = "usage_threshold"
//! default_threshold = 0.8
//! increase_scale_factor = 1.5
//! increase_after_ms = 60000
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};
use crate::handlers::{
    AggregateFunction, AggregateHandler, AggregateOptions, AggregateSpec, DefaultHandler,
    DefaultValue, GroupHandler, JoinHandler, JoinOptions, PerGroupHandler, RecordBatchHandler,
    SortHandler, ThresholdOptions, ThresholdStateMachine, ThresholdStateMachineFactory,
    TimeAggregateRule,
};
use crate::points::ConversionOptions;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Column names used when converting points to batches
    #[serde(default)]
    pub conversion: ConversionOptions,

    /// Handler chain, in execution order
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `kuba_stream=debug`
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One stage of the pipeline
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HandlerConfig {
    Group {
        columns: Vec<String>,
    },
    Join {
        join_on: Vec<String>,
        #[serde(default)]
        tolerance_ms: u64,
    },
    Aggregate {
        /// Specs in text form, e.g. `mean(cpu) as cpu_mean`
        #[serde(default)]
        specs: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_function: Option<AggregateFunction>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_column: Option<String>,
        /// Carry the measurement into folded rows, needed to emit them as points
        #[serde(default)]
        keep_measurement: bool,
    },
    Threshold(ThresholdConfig),
    Sort {
        columns: Vec<String>,
    },
    Default {
        columns: BTreeMap<String, DefaultValue>,
    },
}

/// Threshold state machine settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ThresholdConfig {
    pub watch_column: String,
    pub threshold_column: String,
    pub default_threshold: f64,

    #[serde(default = "default_scale_factor")]
    pub increase_scale_factor: f64,
    #[serde(default)]
    pub increase_after_ms: u64,

    /// `0` disables decreasing
    #[serde(default)]
    pub decrease_trigger_factor: f64,
    #[serde(default = "default_scale_factor")]
    pub decrease_scale_factor: f64,
    #[serde(default)]
    pub decrease_after_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_threshold: Option<f64>,

    /// Keep one machine per group descriptor
    #[serde(default = "default_true")]
    pub per_group: bool,
}

fn default_log_level() -> String { "info".to_string() }
fn default_scale_factor() -> f64 { 1.0 }
fn default_true() -> bool { true }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ThresholdConfig {
    pub fn to_options(&self) -> ThresholdOptions {
        ThresholdOptions {
            watch_column: self.watch_column.clone(),
            threshold_column: self.threshold_column.clone(),
            default_threshold: self.default_threshold,
            increase_scale_factor: self.increase_scale_factor,
            increase_after: Duration::from_millis(self.increase_after_ms),
            decrease_trigger_factor: self.decrease_trigger_factor,
            decrease_scale_factor: self.decrease_scale_factor,
            decrease_after: Duration::from_millis(self.decrease_after_ms),
            min_threshold: self.min_threshold,
            max_threshold: self.max_threshold,
        }
    }
}

impl HandlerConfig {
    /// Construct the handler this entry describes
    pub fn build(&self) -> Result<Box<dyn RecordBatchHandler>> {
        let handler: Box<dyn RecordBatchHandler> = match self {
            HandlerConfig::Group { columns } => Box::new(GroupHandler::new(columns.clone())?),
            HandlerConfig::Join {
                join_on,
                tolerance_ms,
            } => Box::new(JoinHandler::new(
                JoinOptions::new(join_on.clone())
                    .with_tolerance(Duration::from_millis(*tolerance_ms)),
            )?),
            HandlerConfig::Aggregate {
                specs,
                time_function,
                time_column,
                keep_measurement,
            } => {
                let specs = specs
                    .iter()
                    .map(|s| s.parse::<AggregateSpec>())
                    .collect::<Result<Vec<_>>>()?;
                let time_rule = TimeAggregateRule::new(
                    time_function.unwrap_or(AggregateFunction::Last),
                    time_column.clone(),
                )?;
                Box::new(AggregateHandler::new(
                    AggregateOptions::new(specs)
                        .with_time_rule(time_rule)
                        .with_keep_measurement(*keep_measurement),
                )?)
            }
            HandlerConfig::Threshold(config) if config.per_group => Box::new(PerGroupHandler::new(
                Box::new(ThresholdStateMachineFactory::new(config.to_options())?),
            )),
            HandlerConfig::Threshold(config) => {
                Box::new(ThresholdStateMachine::new(config.to_options())?)
            }
            HandlerConfig::Sort { columns } => Box::new(SortHandler::new(columns.clone())?),
            HandlerConfig::Default { columns } => Box::new(DefaultHandler::new(
                columns
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            )?),
        };
        Ok(handler)
    }
}

impl FromStr for PipelineConfig {
    type Err = Error;

    fn from_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::config(format!("failed to parse config: {}", e)))
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        contents.parse()
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Logging
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(level) = std::env::var("KUBA_STREAM_LOG_LEVEL") {
            self.logging.level = level;
        }

        // Conversion
        if let Ok(column) = std::env::var("KUBA_STREAM_TIME_COLUMN") {
            self.conversion.time_column = column;
        }
        if let Ok(column) = std::env::var("KUBA_STREAM_MEASUREMENT_COLUMN") {
            self.conversion.measurement_column = column;
        }
    }

    /// Validate configuration
    ///
    /// Every handler entry is built once, so handler-level checks surface here.
    pub fn validate(&self) -> Result<()> {
        EnvFilter::try_new(&self.logging.level).map_err(|e| {
            Error::config(format!("invalid log level {:?}: {}", self.logging.level, e))
        })?;

        let conversion = &self.conversion;
        if conversion.time_column.is_empty() || conversion.measurement_column.is_empty() {
            return Err(Error::config("conversion column names cannot be empty"));
        }
        if conversion.time_column == conversion.measurement_column {
            return Err(Error::config("time and measurement columns must differ"));
        }

        for (index, handler) in self.handlers.iter().enumerate() {
            handler
                .build()
                .map_err(|e| Error::config(format!("handler #{}: {}", index, e)))?;
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("failed to serialize config: {}", e)))?;

        std::fs::write(path, contents).map_err(|e| {
            Error::config(format!("failed to write config file {}: {}", path.display(), e))
        })
    }
}
