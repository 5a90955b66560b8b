//! PostgreSQL backend implementation for ferry-rdbc
//!
//! Statements are prepared once per connection and cached by SQL text.
//! Parameters are bound against the types the server inferred during
//! preparation, so a text value read back from a CSV file can be inserted
//! into an `integer` or `timestamp` column.

use async_trait::async_trait;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Statement};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Transaction};
use crate::dsn::ConnectionUrl;
use crate::error::{Error, Result};
use crate::types::{ResultSet, Row, Value};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

fn coerce<T>(value: &Value, ty: &Type, f: impl FnOnce(&Value) -> Option<T>) -> Result<Option<T>> {
    if value.is_null() {
        return Ok(None);
    }
    f(value).map(Some).ok_or_else(|| {
        Error::type_conversion(format!(
            "cannot bind {} value '{}' to a {} parameter",
            value.sql_type(),
            value,
            ty
        ))
    })
}

fn to_decimal(value: &Value) -> Option<rust_decimal::Decimal> {
    match value {
        Value::Decimal(d) => Some(*d),
        Value::Int16(n) => Some((*n).into()),
        Value::Int32(n) => Some((*n).into()),
        Value::Int64(n) => Some((*n).into()),
        Value::Float32(n) => rust_decimal::Decimal::try_from(*n).ok(),
        Value::Float64(n) => rust_decimal::Decimal::try_from(*n).ok(),
        Value::String(s) => rust_decimal::Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn to_date(value: &Value) -> Option<chrono::NaiveDate> {
    match value {
        Value::Date(d) => Some(*d),
        Value::DateTime(dt) => Some(dt.date()),
        Value::DateTimeTz(dt) => Some(dt.date_naive()),
        Value::String(s) => chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok(),
        _ => None,
    }
}

fn to_time(value: &Value) -> Option<chrono::NaiveTime> {
    match value {
        Value::Time(t) => Some(*t),
        Value::String(s) => chrono::NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f").ok(),
        _ => None,
    }
}

fn to_timestamp(value: &Value) -> Option<chrono::NaiveDateTime> {
    match value {
        Value::DateTime(dt) => Some(*dt),
        Value::DateTimeTz(dt) => Some(dt.naive_utc()),
        Value::Date(d) => d.and_hms_opt(0, 0, 0),
        Value::String(s) => {
            let s = s.trim();
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(s, fmt).ok())
                .or_else(|| to_date(value).and_then(|d| d.and_hms_opt(0, 0, 0)))
        }
        _ => None,
    }
}

fn to_timestamptz(value: &Value) -> Option<chrono::DateTime<chrono::Utc>> {
    match value {
        Value::DateTimeTz(dt) => Some(*dt),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .ok()
            .or_else(|| to_timestamp(value).map(|dt| dt.and_utc())),
        other => to_timestamp(other).map(|dt| dt.and_utc()),
    }
}

fn to_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::Json(j) => Some(j.clone()),
        Value::String(s) => serde_json::from_str(s).ok(),
        Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
        Value::Int16(_) | Value::Int32(_) | Value::Int64(_) => value.as_i64().map(Into::into),
        Value::Float32(_) | Value::Float64(_) => value.as_f64().map(Into::into),
        _ => None,
    }
}

/// Decode PostgreSQL's `\x` hex text form of `bytea`
fn decode_bytea_hex(s: &str) -> Option<Vec<u8>> {
    let hex = s.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

fn to_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Bytes(b) => Some(b.clone()),
        Value::String(s) => decode_bytea_hex(s).or_else(|| Some(s.as_bytes().to_vec())),
        _ => None,
    }
}

/// Convert a ferry Value into a parameter of the server-inferred type
fn bind_param(value: &Value, ty: &Type) -> Result<BoxedParam> {
    let param: BoxedParam = match *ty {
        Type::BOOL => Box::new(coerce(value, ty, Value::as_bool)?),
        Type::INT2 => Box::new(coerce(value, ty, |v| {
            v.as_i64().and_then(|n| i16::try_from(n).ok())
        })?),
        Type::INT4 => Box::new(coerce(value, ty, |v| {
            v.as_i64().and_then(|n| i32::try_from(n).ok())
        })?),
        Type::INT8 => Box::new(coerce(value, ty, Value::as_i64)?),
        Type::FLOAT4 => Box::new(coerce(value, ty, |v| v.as_f64().map(|n| n as f32))?),
        Type::FLOAT8 => Box::new(coerce(value, ty, Value::as_f64)?),
        Type::NUMERIC => Box::new(coerce(value, ty, to_decimal)?),
        Type::UUID => Box::new(coerce(value, ty, Value::as_uuid)?),
        Type::DATE => Box::new(coerce(value, ty, to_date)?),
        Type::TIME => Box::new(coerce(value, ty, to_time)?),
        Type::TIMESTAMP => Box::new(coerce(value, ty, to_timestamp)?),
        Type::TIMESTAMPTZ => Box::new(coerce(value, ty, to_timestamptz)?),
        Type::JSON | Type::JSONB => Box::new(coerce(value, ty, to_json)?),
        Type::BYTEA => Box::new(coerce(value, ty, to_bytes)?),
        _ => Box::new(coerce(value, ty, Value::as_string)?),
    };
    Ok(param)
}

fn bind_params(statement: &Statement, params: &[Value], sql: &str) -> Result<Vec<BoxedParam>> {
    let types = statement.params();
    if types.len() != params.len() {
        return Err(Error::query_with_sql(
            format!(
                "statement expects {} parameters, got {}",
                types.len(),
                params.len()
            ),
            sql,
        ));
    }
    params
        .iter()
        .zip(types)
        .map(|(value, ty)| bind_param(value, ty))
        .collect()
}

fn param_refs(boxed: &[BoxedParam]) -> Vec<&(dyn ToSql + Sync)> {
    boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn get<'a, T: tokio_postgres::types::FromSql<'a>>(
    row: &'a tokio_postgres::Row,
    idx: usize,
) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        let column = row.columns().get(idx).map(|c| c.name()).unwrap_or("?");
        Error::type_conversion(format!("column '{}': {}", column, e))
    })
}

/// Convert a PostgreSQL value to a ferry Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Result<Value> {
    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx)?.into(),
        Type::INT2 => get::<i16>(row, idx)?.into(),
        Type::INT4 => get::<i32>(row, idx)?.into(),
        Type::INT8 => get::<i64>(row, idx)?.into(),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(Value::Float32).unwrap_or(Value::Null),
        Type::FLOAT8 => get::<f64>(row, idx)?.into(),
        Type::NUMERIC => get::<rust_decimal::Decimal>(row, idx)?.into(),
        Type::BYTEA => get::<Vec<u8>>(row, idx)?.into(),
        Type::DATE => get::<chrono::NaiveDate>(row, idx)?.into(),
        Type::TIME => get::<chrono::NaiveTime>(row, idx)?
            .map(Value::Time)
            .unwrap_or(Value::Null),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)?.into(),
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx)?.into(),
        Type::UUID => get::<uuid::Uuid>(row, idx)?.into(),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx)?.into(),
        // text-like types and anything else String can decode (citext, enums are not)
        _ => get::<String>(row, idx)?.into(),
    };
    Ok(value)
}

/// Convert a tokio-postgres row to a ferry Row
fn pg_row_to_row(columns: &[String], pg_row: &tokio_postgres::Row) -> Result<Row> {
    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect::<Result<Vec<_>>>()?;

    Ok(Row::new(columns.to_vec(), values))
}

fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    match e.code() {
        Some(code) if *code == SqlState::UNDEFINED_TABLE => Error::query_with_sql(
            format!("relation does not exist: {}", e.as_db_error().map(|d| d.message()).unwrap_or_default()),
            sql,
        ),
        Some(code) if *code == SqlState::QUERY_CANCELED => Error::timeout(e.to_string()),
        _ => match e.as_db_error() {
            Some(db) => Error::query_with_sql(db.message().to_string(), sql),
            None => Error::query_with_sql(e.to_string(), sql),
        },
    }
}

/// Session state shared by a connection and its open transaction
struct PgSession {
    client: Client,
    statements: Mutex<HashMap<String, Statement>>,
}

impl PgSession {
    async fn prepare_cached(&self, sql: &str) -> Result<Statement> {
        let mut cache = self.statements.lock().await;
        if let Some(stmt) = cache.get(sql) {
            return Ok(stmt.clone());
        }
        let stmt = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| map_pg_error(e, sql))?;
        cache.insert(sql.to_string(), stmt.clone());
        Ok(stmt)
    }

    async fn query_set(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let stmt = self.prepare_cached(sql).await?;
        let boxed = bind_params(&stmt, params, sql)?;
        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

        let pg_rows = self
            .client
            .query(&stmt, &param_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, sql))?;

        let rows = pg_rows
            .iter()
            .map(|r| pg_row_to_row(&columns, r))
            .collect::<Result<Vec<_>>>()?;
        Ok(ResultSet::new(columns, rows))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let stmt = self.prepare_cached(sql).await?;
        let boxed = bind_params(&stmt, params, sql)?;
        self.client
            .execute(&stmt, &param_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, sql))
    }

    async fn simple(&self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| Error::transaction(format!("{}: {}", sql, e)))
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    session: Arc<PgSession>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: Client) -> Self {
        Self {
            session: Arc::new(PgSession {
                client,
                statements: Mutex::new(HashMap::new()),
            }),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.session.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query_set(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        self.ensure_open()?;
        self.session.query_set(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        self.session.execute(sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        self.session.simple("BEGIN").await?;
        Ok(Box::new(PgTransaction {
            session: Arc::clone(&self.session),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.session.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL transaction
pub struct PgTransaction {
    session: Arc<PgSession>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.session.execute(sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.session.simple("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.session.simple("ROLLBACK").await
    }
}

/// Build a tokio-postgres config from a connection URL.
///
/// The URL is decomposed rather than handed to tokio-postgres verbatim so
/// that dialect+driver schemes (`postgresql+psycopg2`) and a `driver`
/// qualifier are accepted.
fn pg_config(config: &ConnectionConfig) -> Result<tokio_postgres::Config> {
    let url = ConnectionUrl::parse(&config.url)?;

    let mut pg = tokio_postgres::Config::new();
    pg.host(&url.host)
        .port(url.port.unwrap_or(DatabaseType::PostgreSQL.default_port()))
        .user(&url.username);
    if let Some(password) = &url.password {
        pg.password(password);
    }
    if !url.database.is_empty() {
        pg.dbname(&url.database);
    }
    if config.connect_timeout_ms > 0 {
        pg.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
    }
    if config.query_timeout_ms > 0 {
        pg.options(&format!("-c statement_timeout={}", config.query_timeout_ms));
    }
    if let Some(app) = &config.application_name {
        pg.application_name(app);
    }
    if let Some(driver) = url.param("driver") {
        debug!(driver, "ignoring driver qualifier for native PostgreSQL protocol");
    }

    Ok(pg)
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let pg = pg_config(config)?;

        let (client, connection) = pg.connect(tokio_postgres::NoTls).await.map_err(|e| {
            match e.code() {
                Some(code)
                    if *code == SqlState::INVALID_PASSWORD
                        || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION =>
                {
                    Error::authentication(e.to_string())
                }
                _ => Error::connection_with_source("failed to connect to PostgreSQL", e),
            }
        })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection terminated");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}
