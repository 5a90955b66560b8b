//! Error types for ferry-rdbc
//!
//! Every backend failure is mapped into a single [`Error`] enum so that the
//! pipeline can tell an unreachable host from a rejected login or a broken
//! statement without knowing which driver produced it.

use std::fmt;
use thiserror::Error;

/// Result type for ferry-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network or handshake failure
    Connection,
    /// Login rejected by the server
    Authentication,
    /// Statement preparation or execution failed
    Query,
    /// BEGIN/COMMIT/ROLLBACK failed
    Transaction,
    /// A value could not be bound or decoded
    TypeConversion,
    /// Operation timed out
    Timeout,
    /// Invalid connection parameters or identifiers
    Configuration,
    /// Missing table or column
    Schema,
}

impl ErrorCategory {
    /// Whether the failure happened before any statement reached the server
    #[inline]
    pub const fn is_connect_phase(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Authentication | Self::Timeout | Self::Configuration
        )
    }
}

/// Main error type for ferry-rdbc
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication failed
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transaction error
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Table not found
    #[error("table not found: {table}")]
    TableNotFound { table: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::TableNotFound { .. } => ErrorCategory::Schema,
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

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
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
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Authentication => write!(f, "authentication"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::Schema => write!(f, "schema"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_phase_categories() {
        assert!(ErrorCategory::Connection.is_connect_phase());
        assert!(ErrorCategory::Authentication.is_connect_phase());
        assert!(ErrorCategory::Timeout.is_connect_phase());

        assert!(!ErrorCategory::Query.is_connect_phase());
        assert!(!ErrorCategory::TypeConversion.is_connect_phase());
        assert!(!ErrorCategory::Schema.is_connect_phase());
    }

    #[test]
    fn test_error_category_mapping() {
        assert_eq!(
            Error::authentication("bad password").category(),
            ErrorCategory::Authentication
        );
        assert_eq!(
            Error::TableNotFound {
                table: "chest.tb".into()
            }
            .category(),
            ErrorCategory::Schema
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::connection("connection refused");
        assert!(err.to_string().contains("connection refused"));

        let err = Error::query_with_sql("syntax error", "SELECT * FORM users");
        assert!(err.to_string().contains("syntax error"));
        assert!(matches!(err, Error::Query { sql: Some(ref s), .. } if s == "SELECT * FORM users"));
    }

    #[test]
    fn test_connection_with_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::connection_with_source("tcp connect", io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
