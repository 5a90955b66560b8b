//! # ferry-migrate
//!
//! Moves the result of a source query into an existing destination table
//! through a CSV staging file.
//!
//! The pipeline has four phases, run strictly in sequence:
//!
//! 1. **Connect source**: [`create_engine`] + [`Engine::connect`]
//! 2. **Export**: [`export_to_csv`] writes the full result, index column first
//! 3. **Connect destination**
//! 4. **Import**: [`import_from_csv`] appends every staged row
//!
//! Each phase has its own error type; [`PipelineError`] records which
//! phase failed.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ferry_migrate::{Pipeline, PipelineConfig};
//!
//! let config = PipelineConfig::from_file("ferry.yaml")?;
//! let report = Pipeline::new(config).run().await?;
//! println!("{} rows migrated", report.rows_imported);
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod import;
pub mod pipeline;
pub mod staging;
pub mod testing;
pub mod types;

pub use config::{ConnectionDescriptor, PipelineConfig, PipelineOptions};
pub use engine::{create_engine, Engine, EngineRegistry};
pub use error::{
    ConfigError, ConnectError, ExportError, ImportError, Phase, PipelineError, StagingError,
};
pub use export::{export_to_csv, ExportSummary};
pub use import::{import_from_csv, prepare_import, ImportOptions, ImportSummary};
pub use pipeline::{CheckReport, MigrationReport, Pipeline};
pub use types::SensitiveString;
