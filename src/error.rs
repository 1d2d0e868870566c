//! Error types for the ambient database layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Engine-level failures coming from `sqlx` are classified into the same taxonomy so
//! callers can tell configuration mistakes, connectivity problems and programming
//! errors (a missing ambient session) apart.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        suggestion: String,
        /// Last underlying driver failure, if any.
        source: Option<Box<sqlx::Error>>,
    },

    #[error("Missing session: {reason}")]
    MissingSession { reason: String },

    #[error("Invalid statement: {message}")]
    Validation { message: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Session manager is not initialized")]
    Uninitialized,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
            source: None,
        }
    }

    /// Create a connection error that keeps the driver failure as its source.
    pub fn connection_with_source(
        message: impl Into<String>,
        suggestion: impl Into<String>,
        source: sqlx::Error,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a missing session error.
    pub fn missing_session(reason: impl Into<String>) -> Self {
        Self::MissingSession {
            reason: reason.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::MissingSession { .. } => {
                Some("Wrap the call in transactional(), with_session() or an explicit scope")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// A missing session is a programming error and never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if this error reports an absent, closed or foreign ambient session.
    pub fn is_missing_session(&self) -> bool {
        matches!(self, Self::MissingSession { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out waiting for a pooled connection",
                "Raise max_connections or acquire_timeout, or release idle sessions sooner",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reinitialize the session manager")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::validation(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::validation(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::validation(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::validation(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Encode(source) => {
                DbError::validation(format!("Failed to encode argument: {}", source))
            }
            sqlx::Error::Decode(source) => {
                DbError::validation(format!("Decode error: {}", source))
            }
            sqlx::Error::AnyDriverError(err) => DbError::connection(
                format!("Driver error: {}", err),
                "Check that the URL scheme names an installed driver",
            ),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
