//! Orchestrator
//!
//! Runs connect source → export → connect destination → import, strictly
//! in sequence. The first failure aborts the run and is returned as a
//! [`PipelineError`] naming the phase. Nothing is retried, and the staging
//! file is left on disk whatever the outcome.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ferry_rdbc::connection::Connection;
use ferry_rdbc::Value;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::engine::{create_engine, Engine, EngineRegistry};
use crate::error::{ConnectError, PipelineError};
use crate::export::{export_to_csv, ExportSummary};
use crate::import::{import_from_csv, ImportOptions, ImportSummary};

/// Result of a full migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Rows written to the staging file
    pub rows_exported: u64,
    /// Rows appended to the destination
    pub rows_imported: u64,
    /// Staging file location
    pub staging_path: PathBuf,
    /// Qualified destination table
    pub table: String,
    /// Wall-clock start of the run
    pub started_at: DateTime<Utc>,
    /// Total run time
    pub elapsed: Duration,
}

/// Result of a connectivity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    /// Redacted source URL
    pub source: String,
    /// Redacted destination URL
    pub destination: String,
    /// Qualified destination table
    pub table: String,
    /// Whether the destination table exists
    pub table_exists: bool,
}

/// One configured migration
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    registry: EngineRegistry,
}

impl Pipeline {
    /// Pipeline using every backend compiled into this build
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            registry: EngineRegistry::default(),
        }
    }

    /// Replace the backend registry
    pub fn with_registry(mut self, registry: EngineRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// The configuration this pipeline runs
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Engine for the source database
    pub fn source_engine(&self) -> Result<Engine, ConnectError> {
        create_engine(&self.config.source, &self.config.options, &self.registry)
    }

    /// Engine for the destination database
    pub fn destination_engine(&self) -> Result<Engine, ConnectError> {
        create_engine(
            &self.config.destination,
            &self.config.options,
            &self.registry,
        )
    }

    /// Connect to the source and write the staging file
    pub async fn export(&self) -> Result<ExportSummary, PipelineError> {
        let engine = self.source_engine().map_err(PipelineError::SourceConnect)?;
        let conn = engine
            .connect()
            .await
            .map_err(PipelineError::SourceConnect)?;

        let outcome = export_to_csv(
            conn.as_ref(),
            &self.config.query,
            &self.config.index_column,
            &self.config.staging_path,
        )
        .await;
        close(conn.as_ref(), "source").await;

        Ok(outcome?)
    }

    /// Connect to the destination and append the staging file
    pub async fn import(&self) -> Result<ImportSummary, PipelineError> {
        let engine = self
            .destination_engine()
            .map_err(PipelineError::DestinationConnect)?;
        let conn = engine
            .connect()
            .await
            .map_err(PipelineError::DestinationConnect)?;

        let outcome = import_from_csv(
            conn.as_ref(),
            engine.dialect().as_ref(),
            &self.config.target_table(),
            &self.config.staging_path,
            ImportOptions::from(&self.config.options),
        )
        .await;
        close(conn.as_ref(), "destination").await;

        Ok(outcome?)
    }

    /// Run the whole migration
    pub async fn run(&self) -> Result<MigrationReport, PipelineError> {
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            source = %self.config.source.kind,
            destination = %self.config.destination.kind,
            table = %self.config.target_table(),
            staging = %self.config.staging_path.display(),
            "Starting migration"
        );

        let result = async {
            let exported = self.export().await?;
            let imported = self.import().await?;
            Ok::<_, PipelineError>((exported, imported))
        }
        .await;

        let (exported, imported) = result.map_err(|e| {
            error!(phase = %e.phase(), error = %e, "error migrating data");
            e
        })?;

        let report = MigrationReport {
            rows_exported: exported.rows,
            rows_imported: imported.rows,
            staging_path: exported.path,
            table: imported.table,
            started_at,
            elapsed: start.elapsed(),
        };

        info!(
            rows_exported = report.rows_exported,
            rows_imported = report.rows_imported,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Migration complete"
        );

        Ok(report)
    }

    /// Connect to both databases and check that the destination table exists
    pub async fn check(&self) -> Result<CheckReport, PipelineError> {
        let source = self.source_engine().map_err(PipelineError::SourceConnect)?;
        let conn = source
            .connect()
            .await
            .map_err(PipelineError::SourceConnect)?;
        close(conn.as_ref(), "source").await;

        let destination = self
            .destination_engine()
            .map_err(PipelineError::DestinationConnect)?;
        let conn = destination
            .connect()
            .await
            .map_err(PipelineError::DestinationConnect)?;

        let table = self.config.target_table();
        let sql = destination.dialect().table_exists_sql(&table);
        let lookup = conn.query_one(&sql, &[]).await;
        close(conn.as_ref(), "destination").await;

        let table_exists = lookup
            .map_err(|source| {
                PipelineError::DestinationConnect(ConnectError::Connect {
                    target: destination.redacted_url(),
                    source,
                })
            })?
            .and_then(|row| row.get(0).and_then(Value::as_i64))
            .map(|flag| flag != 0)
            .unwrap_or(false);

        info!(table = %table, table_exists, "Connectivity check complete");

        Ok(CheckReport {
            source: source.redacted_url(),
            destination: destination.redacted_url(),
            table: table.qualified_name(),
            table_exists,
        })
    }
}

async fn close(conn: &dyn Connection, role: &str) {
    if let Err(e) = conn.close().await {
        warn!(role, error = %e, "Failed to close connection");
    }
}
