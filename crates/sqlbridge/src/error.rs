//! Error types for sqlbridge
//!
//! Every failure is classified into an [`ErrorCategory`] so retry sites can tell a
//! severed link (reconnect and retry) from a statement or data fault (propagate):
//! - Transient connectivity errors are absorbed by the executors' retry loops
//! - Everything else crosses the bridge unchanged

use std::fmt;
use thiserror::Error;

use crate::classify;

/// Result type for sqlbridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Missing or invalid connect arguments
    Configuration,
    /// A session could not be established or re-established
    Connection,
    /// The database reported a broken link (retriable after reconnect)
    TransientConnectivity,
    /// Statement or data error reported by the database
    Query,
    /// Operation attempted before any successful connect
    NotConnected,
    /// Operation deadline elapsed
    Timeout,
    /// Value could not be converted from the driver representation
    TypeConversion,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are retried by the executors
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::TransientConnectivity)
    }
}

/// Main error type for sqlbridge
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Invalid or missing configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Session could not be opened
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Raw failure reported by the database driver, not yet classified
    #[error("database error{}: {message}", state_suffix(.sql_state))]
    Driver {
        sql_state: Option<String>,
        code: Option<u32>,
        message: String,
    },

    /// Fatal statement or data error
    #[error("query error: {message}")]
    Query {
        message: String,
        sql_state: Option<String>,
        sql: Option<String>,
    },

    /// No successful connect has happened yet
    #[error("not connected: call connect before issuing statements")]
    NotConnected,

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Driver { .. } if classify::is_transient(self) => {
                ErrorCategory::TransientConnectivity
            }
            Self::Driver { .. } | Self::Query { .. } => ErrorCategory::Query,
            Self::NotConnected => ErrorCategory::NotConnected,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// SQLSTATE reported by the database, if any
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Driver { sql_state, .. } | Self::Query { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
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

    /// Create a driver error carrying a SQLSTATE
    pub fn driver(sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver {
            sql_state: Some(sql_state.into()),
            code: None,
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql_state: None,
            sql: None,
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

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Turn an unclassified driver failure into a fatal [`Error::Query`] for `sql`.
    ///
    /// Other variants pass through untouched.
    pub fn into_query_error(self, sql: &str) -> Self {
        match self {
            Self::Driver {
                sql_state, message, ..
            } => Self::Query {
                message,
                sql_state,
                sql: Some(sql.to_string()),
            },
            other => other,
        }
    }

    /// Wrap the last transient failure once the retry budget is spent
    pub fn retries_exhausted(attempts: u32, last: Error) -> Self {
        Self::Connection {
            message: format!("connection lost and not recovered after {attempts} attempts"),
            source: Some(Box::new(last)),
        }
    }
}

fn state_suffix(sql_state: &Option<String>) -> String {
    sql_state
        .as_deref()
        .map(|s| format!(" [{s}]"))
        .unwrap_or_default()
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::config(errors.to_string())
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Connection => write!(f, "connection"),
            Self::TransientConnectivity => write!(f, "transient_connectivity"),
            Self::Query => write!(f, "query"),
            Self::NotConnected => write!(f, "not_connected"),
            Self::Timeout => write!(f, "timeout"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Other => write!(f, "other"),
        }
    }
}
