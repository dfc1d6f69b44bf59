//! Error types for seedbed
//!
//! Fatal errors abort the whole extraction or load call. Recoverable data
//! problems (oversized cells, unloadable columns) are logged instead and
//! never surface here.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for seedbed operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for seedbed
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A requested dataset directory does not exist
    #[error("dataset '{name}' not found under {root}")]
    DatasetNotFound { name: String, root: PathBuf },

    /// A dataset file or request names a table the database does not have
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// The execution model names constraints the live schema does not have
    #[error("table {table} has no constraint(s) {}", .constraints.join(", "))]
    UnknownConstraints {
        table: String,
        constraints: Vec<String>,
    },

    /// A cell could not be bound to its column
    #[error("cannot bind {table}.{column} at line {line}: {message}")]
    Binding {
        table: String,
        column: String,
        line: u64,
        message: String,
    },

    /// Restoring constraints after a load failed
    #[error("failed to restore constraints: {0}")]
    Restore(String),

    /// Database error
    #[error(transparent)]
    Database(#[from] seedbed_rdbc::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Tabular file error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether the error reflects a mismatch between a request and the live schema
    pub fn is_schema_mismatch(&self) -> bool {
        match self {
            Self::TableNotFound(_) | Self::UnknownConstraints { .. } => true,
            Self::Database(e) => e.category() == seedbed_rdbc::error::ErrorCategory::Schema,
            _ => false,
        }
    }
}
