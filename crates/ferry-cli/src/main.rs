//! ferry - move a query result into a table through a CSV file
//!
//! # Usage
//!
//! ```bash
//! # Full migration (export, then import)
//! ferry -c ferry.yaml
//!
//! # Only write the staging file
//! ferry -c ferry.yaml export
//!
//! # Only load an existing staging file
//! ferry -c ferry.yaml import
//!
//! # Validate configuration
//! ferry -c ferry.yaml validate
//!
//! # Check connectivity and that the destination table exists
//! ferry -c ferry.yaml check
//! ```
//!
//! Exit codes: 0 success, 1 configuration, 2 connection, 3 export, 4 import.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ferry_migrate::{ImportError, Phase, Pipeline, PipelineConfig, PipelineError};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(version, about = "Migrate a query result into a table through a CSV staging file")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ferry.yaml", env = "FERRY_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Export then import (default)
    Run,
    /// Run the query and write the staging file
    Export,
    /// Append the staging file to the destination table
    Import,
    /// Validate the configuration file
    Validate,
    /// Connect to both databases and look up the destination table
    Check,
    /// Print the JSON schema of the configuration file
    Schema {
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

const EXIT_CONFIG: u8 = 1;
const EXIT_CONNECT: u8 = 2;
const EXIT_EXPORT: u8 = 3;
const EXIT_IMPORT: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PipelineError>() {
        Some(e) => match e.phase() {
            Phase::ConnectSource | Phase::ConnectDestination => EXIT_CONNECT,
            Phase::Export => EXIT_EXPORT,
            Phase::Import => EXIT_IMPORT,
        },
        None => EXIT_CONFIG,
    }
}

async fn execute(cli: Cli) -> Result<()> {
    // Commands that don't need config
    if let Some(Commands::Schema { format }) = &cli.command {
        return show_schema(format);
    }

    let config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Export => export(config).await,
        Commands::Import => import(config).await,
        Commands::Validate => validate_config(&config),
        Commands::Check => check(config).await,
        Commands::Schema { .. } => unreachable!(), // handled above
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::from_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

async fn run(config: PipelineConfig) -> Result<()> {
    let report = Pipeline::new(config).run().await?;

    println!(
        "✓ Migrated {} rows into {} in {:.2}s (staging file: {})",
        report.rows_imported,
        report.table,
        report.elapsed.as_secs_f64(),
        report.staging_path.display()
    );
    Ok(())
}

async fn export(config: PipelineConfig) -> Result<()> {
    let summary = Pipeline::new(config).export().await?;
    println!(
        "✓ Exported {} rows to {}",
        summary.rows,
        summary.path.display()
    );
    Ok(())
}

async fn import(config: PipelineConfig) -> Result<()> {
    let summary = Pipeline::new(config).import().await?;
    println!(
        "✓ Appended {} rows to {} in {} batches",
        summary.rows, summary.table, summary.batches
    );
    Ok(())
}

fn validate_config(config: &PipelineConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");
    print!("{}", redacted_summary(config)?);
    Ok(())
}

fn redacted_summary(config: &PipelineConfig) -> Result<String> {
    let source = config.source.connection_string()?;
    let destination = config.destination.connection_string()?;

    let mut out = String::new();
    out.push_str(&format!(
        "Source:      {}\n",
        ferry_rdbc::connection::redact_url(&source)
    ));
    out.push_str(&format!(
        "Destination: {}\n",
        ferry_rdbc::connection::redact_url(&destination)
    ));
    out.push_str(&format!("Index column: {}\n", config.index_column));
    out.push_str(&format!(
        "Staging file: {}\n",
        config.staging_path.display()
    ));
    out.push_str(&format!("Target table: {}\n", config.target_table()));
    out.push_str(&format!(
        "Batch size: {} ({})\n",
        config.options.batch_size,
        if config.options.transactional {
            "transactional"
        } else {
            "autocommit"
        }
    ));
    Ok(out)
}

async fn check(config: PipelineConfig) -> Result<()> {
    println!("Running connectivity checks...\n");
    let report = Pipeline::new(config).check().await?;

    println!("Source      {} ✓ connected", report.source);
    println!("Destination {} ✓ connected", report.destination);

    if !report.table_exists {
        println!("Table       {} ✗ not found", report.table);
        return Err(PipelineError::Import(ImportError::InvalidTarget(
            ferry_rdbc::Error::TableNotFound {
                table: report.table,
            },
        ))
        .into());
    }

    println!("Table       {} ✓ exists", report.table);
    info!("All checks passed");
    Ok(())
}

fn show_schema(format: &str) -> Result<()> {
    let schema = schemars::schema_for!(PipelineConfig);
    match format {
        "yaml" => println!("{}", serde_yaml::to_string(&schema)?),
        "json" => println!("{}", serde_json::to_string_pretty(&schema)?),
        other => anyhow::bail!("Unknown schema format: '{}' (expected json or yaml)", other),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use ferry_migrate::{ConfigError, ConnectError, ExportError};
    use ferry_rdbc::connection::DatabaseType;

    const SAMPLE: &str = r#"
source:
  kind: postgresql+psycopg2
  host: postgres.server.url
  port: 5432
  database: dbName
  username: username
  password: "p@ss"
destination:
  kind: mssql+pyodbc
  host: mssql.server.url
  port: 1433
  database: dbName
  username: username
  password: secret
  driver: SQL+Server
query: SELECT 1 AS key
index_column: key
staging_path: out.csv
schema: chest
table: tb_keyValueData
"#;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_command_and_config() {
        let cli = Cli::try_parse_from(["ferry"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);

        let cli = Cli::try_parse_from(["ferry", "-c", "other.yaml", "-v", "import"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
        assert!(cli.verbose);
        assert_eq!(cli.command, Some(Commands::Import));
    }

    #[test]
    fn test_exit_codes() {
        let connect = anyhow::Error::new(PipelineError::DestinationConnect(
            ConnectError::UnsupportedBackend(DatabaseType::SqlServer),
        ));
        assert_eq!(exit_code(&connect), EXIT_CONNECT);

        let export = anyhow::Error::new(PipelineError::Export(ExportError::IndexColumnNotFound {
            column: "key".into(),
            available: String::new(),
        }));
        assert_eq!(exit_code(&export), EXIT_EXPORT);

        let import = anyhow::Error::new(PipelineError::Import(ImportError::NoColumns {
            path: PathBuf::from("x.csv"),
        }));
        assert_eq!(exit_code(&import), EXIT_IMPORT);

        let config = anyhow::Error::new(ConfigError::Invalid("bad".into()))
            .context("Failed to load config");
        assert_eq!(exit_code(&config), EXIT_CONFIG);
    }

    #[test]
    fn test_summary_hides_passwords() {
        let config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        let summary = redacted_summary(&config).unwrap();
        assert!(summary.contains("postgres.server.url"));
        assert!(summary.contains("chest.tb_keyValueData"));
        assert!(!summary.contains("p%40ss"));
        assert!(!summary.contains("secret"));
    }

    #[test]
    fn test_schema_formats() {
        assert!(show_schema("json").is_ok());
        assert!(show_schema("yaml").is_ok());
        assert!(show_schema("toml").is_err());
    }
}
