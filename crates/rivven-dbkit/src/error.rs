//! Error types for rivven-dbkit
//!
//! Errors are classified so callers can tell apart:
//! - configuration mistakes caught before any I/O (bad sizes, malformed SQL)
//! - binding mistakes (unknown or missing parameter names)
//! - failures reported by the underlying driver
//! - failures raised by row or completion callbacks in a pipeline

use std::fmt;
use thiserror::Error;

/// Result type for rivven-dbkit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed source error
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable)
    Connection,
    /// Query execution errors
    Query,
    /// Transaction errors
    Transaction,
    /// Constraint violation (not retriable)
    Constraint,
    /// Type conversion errors (not retriable)
    TypeConversion,
    /// Timeout errors (retriable)
    Timeout,
    /// Deadlock detected (retriable)
    Deadlock,
    /// Pool exhausted (retriable with backoff)
    PoolExhausted,
    /// Invalid configuration or malformed SQL
    Configuration,
    /// Parameter binding referenced a name absent from the compiled SQL
    UnknownParameter,
    /// A row callback failed
    Worker,
    /// The completion callback failed
    Completion,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::Deadlock | Self::PoolExhausted
        )
    }

    /// Whether the failure was reported by the database driver
    #[inline]
    pub const fn is_database(self) -> bool {
        matches!(
            self,
            Self::Connection
                | Self::Query
                | Self::Transaction
                | Self::Constraint
                | Self::TypeConversion
                | Self::Timeout
                | Self::Deadlock
                | Self::PoolExhausted
        )
    }
}

/// Main error type for rivven-dbkit
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Transaction error
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Constraint violation (PK, FK, unique, check)
    #[error("constraint violation: {constraint_name} - {message}")]
    Constraint {
        constraint_name: String,
        message: String,
    },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Deadlock detected
    #[error("deadlock detected")]
    Deadlock,

    /// Connection pool exhausted
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// SQL text could not be compiled
    #[error("sql parse error at byte {position}: {message}")]
    Parse { message: String, position: usize },

    /// Named parameter has no value in the supplied parameter source
    #[error("missing value for parameter '{name}'")]
    MissingParameter { name: String },

    /// Bound a name the compiled SQL does not contain
    #[error("unknown parameter '{name}'")]
    UnknownParameter { name: String },

    /// A row callback failed
    #[error("row callback failed on row {row}: {message}")]
    Worker {
        row: u64,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The completion callback failed
    #[error("completion callback failed: {message}")]
    Completion {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Unsupported operation for this backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Constraint { .. } => ErrorCategory::Constraint,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Deadlock => ErrorCategory::Deadlock,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Configuration { .. } | Self::Parse { .. } | Self::MissingParameter { .. } => {
                ErrorCategory::Configuration
            }
            Self::UnknownParameter { .. } => ErrorCategory::UnknownParameter,
            Self::Worker { .. } => ErrorCategory::Worker,
            Self::Completion { .. } => ErrorCategory::Completion,
            Self::Unsupported { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error was reported by the database driver
    #[inline]
    pub fn is_database(&self) -> bool {
        self.category().is_database()
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a parse error at a byte position of the SQL text
    pub fn parse(message: impl Into<String>, position: usize) -> Self {
        Self::Parse {
            message: message.into(),
            position,
        }
    }

    /// Create an unknown parameter error
    pub fn unknown_parameter(name: impl Into<String>) -> Self {
        Self::UnknownParameter { name: name.into() }
    }

    /// Create a missing parameter error
    pub fn missing_parameter(name: impl Into<String>) -> Self {
        Self::MissingParameter { name: name.into() }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a row callback failure
    pub fn worker(row: u64, source: Error) -> Self {
        Self::Worker {
            row,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Wrap a completion callback failure
    pub fn completion(source: Error) -> Self {
        Self::Completion {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Combine the outcome of an operation with the outcome of releasing the
/// resources it used.
///
/// The operation's error always wins; a release error raised on top of it is
/// only logged.
pub(crate) fn settle<T>(result: Result<T>, release: Result<()>, what: &str) -> Result<T> {
    match (result, release) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            tracing::warn!(error = %release_err, "failed to release {} after error", what);
            Err(e)
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::Constraint => write!(f, "constraint"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Timeout => write!(f, "timeout"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Configuration => write!(f, "configuration"),
            Self::UnknownParameter => write!(f, "unknown_parameter"),
            Self::Worker => write!(f, "worker"),
            Self::Completion => write!(f, "completion"),
            Self::Other => write!(f, "other"),
        }
    }
}
