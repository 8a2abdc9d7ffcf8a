//! Error types for the storage engine.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// I/O error on the backing file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Page allocator exhausted (in-memory mode has a fixed capacity)
    #[error("page capacity exceeded: {capacity} pages allocated")]
    CapacityExceeded {
        /// Configured page capacity
        capacity: usize,
    },

    /// Malformed line in a configuration file
    #[error("config parse error at line {line}: {message}")]
    ConfigParse {
        /// 1-based line number
        line: usize,
        /// What was wrong with the line
        message: String,
    },

    /// Invalid argument (e.g. split fraction outside (0, 1])
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl EngineError {
    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a config-parse error for the given line
    pub fn config_parse(line: usize, msg: impl Into<String>) -> Self {
        Self::ConfigParse {
            line,
            message: msg.into(),
        }
    }
}
