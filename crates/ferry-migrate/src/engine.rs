//! Connection factory
//!
//! [`create_engine`] turns a [`ConnectionDescriptor`] into a lazy
//! [`Engine`]: the descriptor is validated and the connection URL built up
//! front, but no network traffic happens until [`Engine::connect`].
//! Backends are looked up in an [`EngineRegistry`] so tests can swap in an
//! in-memory database.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ferry_rdbc::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType};
use ferry_rdbc::dialect::{dialect_for, SqlDialect};
use tracing::{debug, info};

use crate::config::{ConnectionDescriptor, PipelineOptions};
use crate::error::ConnectError;

/// Connection factories keyed by database type
#[derive(Clone)]
pub struct EngineRegistry {
    factories: HashMap<DatabaseType, Arc<dyn ConnectionFactory>>,
}

impl EngineRegistry {
    /// A registry with no backends
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register (or replace) the factory used for `database_type`
    pub fn with_factory(
        mut self,
        database_type: DatabaseType,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        self.register(database_type, factory);
        self
    }

    /// Register (or replace) the factory used for `database_type`
    pub fn register(&mut self, database_type: DatabaseType, factory: Arc<dyn ConnectionFactory>) {
        self.factories.insert(database_type, factory);
    }

    /// Factory for `database_type`, if any
    pub fn get(&self, database_type: DatabaseType) -> Option<Arc<dyn ConnectionFactory>> {
        self.factories.get(&database_type).cloned()
    }
}

/// Registry with every backend compiled into this build
impl Default for EngineRegistry {
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::empty();

        #[cfg(feature = "postgres")]
        registry.register(
            DatabaseType::PostgreSQL,
            Arc::new(ferry_rdbc::postgres::PgConnectionFactory),
        );

        #[cfg(feature = "sqlserver")]
        registry.register(
            DatabaseType::SqlServer,
            Arc::new(ferry_rdbc::sqlserver::SqlServerConnectionFactory),
        );

        registry
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.factories.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("EngineRegistry").field("backends", &kinds).finish()
    }
}

/// A reusable, lazily connecting database handle
pub struct Engine {
    database_type: DatabaseType,
    config: ConnectionConfig,
    factory: Arc<dyn ConnectionFactory>,
}

impl Engine {
    /// Backend this engine talks to
    pub fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    /// SQL dialect of the backend
    pub fn dialect(&self) -> Box<dyn SqlDialect> {
        dialect_for(self.database_type)
    }

    /// Connection settings, including the full URL
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connection URL with the password masked
    pub fn redacted_url(&self) -> String {
        self.config.redacted_url()
    }

    /// Open a new connection
    pub async fn connect(&self) -> Result<Box<dyn Connection>, ConnectError> {
        let target = self.redacted_url();
        debug!(target = %target, backend = %self.database_type, "Connecting");

        let conn = self
            .factory
            .connect(&self.config)
            .await
            .map_err(|source| ConnectError::Connect {
                target: target.clone(),
                source,
            })?;

        debug!(target = %target, "Connected");
        Ok(conn)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("database_type", &self.database_type)
            .field("config", &self.config)
            .finish()
    }
}

/// Build an engine from a descriptor without connecting
pub fn create_engine(
    descriptor: &ConnectionDescriptor,
    options: &PipelineOptions,
    registry: &EngineRegistry,
) -> Result<Engine, ConnectError> {
    let database_type = descriptor
        .database_type()
        .map_err(ConnectError::InvalidDescriptor)?;
    let config = descriptor
        .connection_config(options)
        .map_err(ConnectError::InvalidDescriptor)?;
    let factory = registry
        .get(database_type)
        .ok_or(ConnectError::UnsupportedBackend(database_type))?;

    info!(
        kind = %descriptor.kind,
        backend = %database_type,
        target = %config.redacted_url(),
        "Engine created"
    );

    Ok(Engine {
        database_type,
        config,
        factory,
    })
}
