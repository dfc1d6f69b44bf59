//! Error types for seedbed-rdbc
//!
//! Every error maps to an [`ErrorCategory`]. Only connection and timeout
//! failures are worth another attempt; the connection retry loop in
//! [`crate::connection::connect_with_retry`] relies on that split.

use std::fmt;
use thiserror::Error;

/// Result type for seedbed-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Server unreachable or connection lost
    Connection,
    /// Statement rejected or failed while running
    Query,
    /// Value could not be converted to or from a column type
    TypeConversion,
    /// Statement or connect attempt timed out
    Timeout,
    /// Credentials rejected
    Authentication,
    /// Bad URL, option or predicate
    Configuration,
    /// Table, column or constraint metadata missing or unreadable
    Schema,
    /// Anything the backend cannot do
    Other,
}

impl ErrorCategory {
    /// Whether another attempt could succeed
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }

    /// Stable lowercase name, used in log fields
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Query => "query",
            Self::TypeConversion => "type_conversion",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::Configuration => "configuration",
            Self::Schema => "schema",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for seedbed-rdbc
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Could not reach the server, or lost it
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// A statement failed; `sql` is kept for diagnostics, never logged with
    /// parameters
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Metadata could not be read or does not fit what the caller expects
    #[error("schema error: {message}")]
    Schema { message: String },

    #[error("table not found: {table}")]
    TableNotFound { table: String },

    #[error("column not found: {column} in table {table}")]
    ColumnNotFound { table: String, column: String },

    /// The backend has no way to do this
    #[error("unsupported: {message}")]
    Unsupported { message: String },
}

impl Error {
    /// Classification of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Schema { .. } | Self::TableNotFound { .. } | Self::ColumnNotFound { .. } => {
                ErrorCategory::Schema
            }
            Self::Unsupported { .. } => ErrorCategory::Other,
        }
    }

    /// Whether another attempt could succeed
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Connection failure without an underlying cause
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Connection failure wrapping the driver error
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Statement failure
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Statement failure, keeping the statement text
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Statement failure wrapping the driver error
    pub fn query_with_source(
        message: impl Into<String>,
        sql: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: Some(Box::new(source)),
        }
    }

    #[allow(missing_docs)]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    #[allow(missing_docs)]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    #[allow(missing_docs)]
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    #[allow(missing_docs)]
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Missing table, named the way the caller displays it
    pub fn table_not_found(table: impl fmt::Display) -> Self {
        Self::TableNotFound {
            table: table.to_string(),
        }
    }

    #[allow(missing_docs)]
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Statement text attached to a query error
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Query { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }
}
