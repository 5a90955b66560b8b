//! Pipeline configuration
//!
//! A single YAML document describes one migration:
//!
//! ```yaml
//! source:
//!   kind: postgresql+psycopg2
//!   host: postgres.server.url
//!   port: 5432
//!   database: dbName
//!   username: username
//!   password: ${SOURCE_PASSWORD}
//! destination:
//!   kind: mssql+pyodbc
//!   host: mssql.server.url
//!   port: 1433
//!   database: dbName
//!   username: username
//!   password: ${DEST_PASSWORD:-changeme}
//!   driver: SQL+Server
//! query: SELECT key AS "Key", display_key AS "DisplayKey" FROM key_value_data
//! index_column: key
//! staging_path: ChestDataFromPostgres.csv
//! schema: chest
//! table: tb_keyValueData
//! ```
//!
//! `${VAR}` and `${VAR:-default}` references are expanded from the
//! environment before parsing.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use ferry_rdbc::connection::{ConnectionConfig, DatabaseType};
use ferry_rdbc::dsn::ConnectionUrl;
use ferry_rdbc::security::{validate_sql_identifier, validate_url_component};
use ferry_rdbc::types::TableRef;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigError;
use crate::types::SensitiveString;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration for one migration run
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct PipelineConfig {
    /// Database the rows are read from
    #[validate(nested)]
    pub source: ConnectionDescriptor,

    /// Database the rows are appended to
    #[validate(nested)]
    pub destination: ConnectionDescriptor,

    /// Query run against the source
    #[validate(length(min = 1))]
    pub query: String,

    /// Result column written first in the staging file
    #[validate(length(min = 1, max = 128))]
    pub index_column: String,

    /// Local CSV file handed from export to import
    pub staging_path: PathBuf,

    /// Destination schema
    #[validate(length(min = 1, max = 128))]
    pub schema: String,

    /// Destination table (must already exist)
    #[validate(length(min = 1, max = 128))]
    pub table: String,

    /// Tuning knobs
    #[serde(default)]
    #[validate(nested)]
    pub options: PipelineOptions,
}

/// Everything needed to build one connection
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct ConnectionDescriptor {
    /// Connection kind, e.g. `postgresql+psycopg2` or `mssql+pyodbc`
    #[validate(length(min = 1, max = 64))]
    pub kind: String,

    /// Server host name or address
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    /// Server port
    #[validate(range(min = 1))]
    pub port: u16,

    /// Database name
    #[validate(length(min = 1, max = 128))]
    pub database: String,

    /// Login name
    #[validate(length(min = 1, max = 128))]
    pub username: String,

    /// Login password
    #[serde(default)]
    pub password: SensitiveString,

    /// Optional driver name, appended as `?driver=...`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

impl ConnectionDescriptor {
    /// Backend selected by the dialect part of `kind`
    pub fn database_type(&self) -> ferry_rdbc::Result<DatabaseType> {
        self.kind.parse()
    }

    /// Decomposed connection URL
    pub fn to_url(&self) -> ConnectionUrl {
        ConnectionUrl {
            scheme: self.kind.clone(),
            host: self.host.clone(),
            port: Some(self.port),
            database: self.database.clone(),
            username: self.username.clone(),
            password: Some(self.password.expose_secret().to_string()),
            params: self
                .driver
                .iter()
                .filter(|d| !d.is_empty())
                .map(|d| ("driver".to_string(), d.clone()))
                .collect(),
        }
    }

    /// `{kind}://{user}:{password}@{host}:{port}/{database}[?driver=...]`
    /// with username and password percent-encoded
    pub fn connection_string(&self) -> ferry_rdbc::Result<String> {
        self.to_url().to_url_string()
    }

    /// Connection settings for the rdbc layer
    pub fn connection_config(&self, options: &PipelineOptions) -> ferry_rdbc::Result<ConnectionConfig> {
        let mut config = ConnectionConfig::new(self.connection_string()?)
            .with_connect_timeout(options.connect_timeout_ms)
            .with_query_timeout(options.query_timeout_ms);
        if options.trust_cert {
            config = config.with_property("trust_cert", "true");
        }
        Ok(config)
    }

    fn check(&self, role: &str) -> Result<(), ConfigError> {
        let invalid = |e: ferry_rdbc::Error| ConfigError::Invalid(format!("{role}: {e}"));

        self.database_type().map_err(invalid)?;
        validate_url_component("host", &self.host).map_err(invalid)?;
        validate_url_component("database", &self.database).map_err(invalid)?;
        self.connection_string().map_err(invalid)?;
        Ok(())
    }
}

/// Optional settings with defaults
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct PipelineOptions {
    /// INSERT statements sent per round of execution
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 100000))]
    pub batch_size: usize,

    /// Wrap the whole import in one destination transaction
    #[serde(default)]
    pub transactional: bool,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 100, max = 600000))]
    pub connect_timeout_ms: u64,

    /// Per-statement timeout in milliseconds (0, the default, disables it)
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Trust the SQL Server TLS certificate without validation
    #[serde(default)]
    pub trust_cert: bool,
}

fn default_batch_size() -> usize {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_query_timeout_ms() -> u64 {
    0
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            transactional: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            trust_cert: false,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text, expanding environment variables
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.check()?;
        Ok(config)
    }

    /// Structural and semantic validation
    pub fn check(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        self.source.check("source")?;
        self.destination.check("destination")?;

        validate_sql_identifier(&self.schema)
            .map_err(|e| ConfigError::Invalid(format!("schema: {e}")))?;
        validate_sql_identifier(&self.table)
            .map_err(|e| ConfigError::Invalid(format!("table: {e}")))?;

        if self.index_column.trim().is_empty() {
            return Err(ConfigError::Invalid("index_column must not be blank".into()));
        }
        if self.staging_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("staging_path must not be empty".into()));
        }
        Ok(())
    }

    /// Destination table reference
    pub fn target_table(&self) -> TableRef {
        TableRef::qualified(&self.schema, &self.table)
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
pub fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}
