//! Typed errors for each phase of a migration.
//!
//! Every phase returns its own error enum; [`PipelineError`] wraps them and
//! records which phase failed so callers can report a distinguishable
//! outcome.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use ferry_rdbc::connection::DatabaseType;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The YAML could not be parsed into a configuration
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Structural or semantic validation failed
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors raised by the connection factory
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The descriptor cannot be turned into a connection URL
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(#[source] ferry_rdbc::Error),

    /// No backend is compiled in or registered for this database type
    #[error("no connection backend available for {0}")]
    UnsupportedBackend(DatabaseType),

    /// The server could not be reached or rejected the login
    #[error("failed to connect to {target}: {source}")]
    Connect {
        /// Redacted connection URL
        target: String,
        #[source]
        source: ferry_rdbc::Error,
    },
}

/// Errors raised while reading or writing the staging file
#[derive(Debug, Error)]
pub enum StagingError {
    /// Filesystem failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// CSV encoding or decoding failure
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Errors raised by the exporter
#[derive(Debug, Error)]
pub enum ExportError {
    /// The source query failed
    #[error("source query failed: {0}")]
    Query(#[source] ferry_rdbc::Error),

    /// The index column is not part of the query result
    #[error("index column '{column}' not found in query result (columns: {available})")]
    IndexColumnNotFound { column: String, available: String },

    /// The staging file could not be written
    #[error("failed to write staging file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: StagingError,
    },
}

/// Errors raised by the importer
#[derive(Debug, Error)]
pub enum ImportError {
    /// The staging file could not be read
    #[error("failed to read staging file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: StagingError,
    },

    /// A record does not have the same number of fields as the header
    #[error("malformed staging file {path}: line {line} has {found} fields, expected {expected}")]
    Malformed {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },

    /// The file has no header row or no data columns after the index
    #[error("staging file {path} has no data columns")]
    NoColumns { path: PathBuf },

    /// Schema or table name was rejected
    #[error("invalid target table: {0}")]
    InvalidTarget(#[source] ferry_rdbc::Error),

    /// An INSERT failed; `rows_sent` rows were sent before the failing batch
    #[error("append to {table} failed after {rows_sent} rows: {source}")]
    Insert {
        table: String,
        rows_sent: u64,
        #[source]
        source: ferry_rdbc::Error,
    },

    /// BEGIN/COMMIT failed in transactional mode
    #[error("transaction on {table} failed: {source}")]
    Transaction {
        table: String,
        #[source]
        source: ferry_rdbc::Error,
    },
}

/// The step of the pipeline that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Building the source engine or connecting to it
    ConnectSource,
    /// Running the query and writing the staging file
    Export,
    /// Building the destination engine or connecting to it
    ConnectDestination,
    /// Reading the staging file and appending rows
    Import,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectSource => write!(f, "connect-source"),
            Self::Export => write!(f, "export"),
            Self::ConnectDestination => write!(f, "connect-destination"),
            Self::Import => write!(f, "import"),
        }
    }
}

/// Top-level orchestration error
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Source engine creation or connection failed
    #[error("error creating engine for source: {0}")]
    SourceConnect(#[source] ConnectError),

    /// Export failed
    #[error("error exporting data to CSV: {0}")]
    Export(#[from] ExportError),

    /// Destination engine creation or connection failed
    #[error("error creating engine for destination: {0}")]
    DestinationConnect(#[source] ConnectError),

    /// Import failed
    #[error("error loading data from CSV: {0}")]
    Import(#[from] ImportError),
}

impl PipelineError {
    /// The phase that failed
    pub fn phase(&self) -> Phase {
        match self {
            Self::SourceConnect(_) => Phase::ConnectSource,
            Self::Export(_) => Phase::Export,
            Self::DestinationConnect(_) => Phase::ConnectDestination,
            Self::Import(_) => Phase::Import,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_mapping() {
        let err = PipelineError::SourceConnect(ConnectError::UnsupportedBackend(
            DatabaseType::SqlServer,
        ));
        assert_eq!(err.phase(), Phase::ConnectSource);
        assert!(err.to_string().starts_with("error creating engine"));

        let err = PipelineError::from(ExportError::IndexColumnNotFound {
            column: "key".into(),
            available: "a, b".into(),
        });
        assert_eq!(err.phase(), Phase::Export);
        assert!(err.to_string().contains("index column 'key'"));
    }

    #[test]
    fn test_malformed_message() {
        let err = ImportError::Malformed {
            path: PathBuf::from("stage.csv"),
            line: 3,
            expected: 4,
            found: 2,
        };
        assert_eq!(
            err.to_string(),
            "malformed staging file stage.csv: line 3 has 2 fields, expected 4"
        );
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::ConnectDestination.to_string(), "connect-destination");
        assert_eq!(Phase::Import.to_string(), "import");
    }
}
