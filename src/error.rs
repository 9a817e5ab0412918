//! Error types for the transformation engine

use arrow::error::ArrowError;
use thiserror::Error;

/// Main error type for handlers, metadata access and configuration
///
/// Every variant aborts the current `handle` call. Handlers never emit a
/// partial result alongside an error.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing required column or metadata key
    #[error("Schema error: {0}")]
    Schema(String),

    /// Column present but with the wrong underlying type for its role
    #[error("Type error: {0}")]
    Type(String),

    /// Invalid handler or pipeline configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handler invoked without the data it needs
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Malformed or empty snapshot during restore
    #[error("Restore error: {0}")]
    Restore(String),

    /// Failure inside the columnar library
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Error::Schema(message.into())
    }

    /// Create a type error
    pub fn type_error(message: impl Into<String>) -> Self {
        Error::Type(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create a capacity error
    pub fn capacity(message: impl Into<String>) -> Self {
        Error::Capacity(message.into())
    }

    /// Create a restore error
    pub fn restore(message: impl Into<String>) -> Self {
        Error::Restore(message.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;
