//! SQL Server backend implementation for ferry-rdbc
//!
//! Talks TDS directly through tiberius. The `driver` qualifier of an
//! ODBC-style URL (`mssql+pyodbc://...?driver=SQL+Server`) has no meaning
//! here and is ignored.

use async_trait::async_trait;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Transaction};
use crate::dsn::ConnectionUrl;
use crate::error::{Error, Result};
use crate::types::{ResultSet, Row, Value};

type TdsClient = Client<Compat<TcpStream>>;

/// SQL Server error number for "Login failed for user"
const LOGIN_FAILED: u32 = 18456;

/// Typed TDS parameter. Values are sent as RPC parameters, never spliced
/// into the statement text.
struct SqlParam<'a>(&'a Value);

impl tiberius::ToSql for SqlParam<'_> {
    fn to_sql(&self) -> ColumnData<'_> {
        match self.0 {
            Value::Null => ColumnData::String(None),
            Value::Bool(b) => ColumnData::Bit(Some(*b)),
            Value::Int16(n) => ColumnData::I16(Some(*n)),
            Value::Int32(n) => ColumnData::I32(Some(*n)),
            Value::Int64(n) => ColumnData::I64(Some(*n)),
            Value::Float32(n) => ColumnData::F32(Some(*n)),
            Value::Float64(n) => ColumnData::F64(Some(*n)),
            Value::String(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
            Value::Bytes(b) => ColumnData::Binary(Some(Cow::Borrowed(b.as_slice()))),
            Value::Uuid(u) => ColumnData::Guid(Some(*u)),
            // SQL Server converts ISO 8601 text to date/time types implicitly
            Value::Date(d) => ColumnData::String(Some(Cow::Owned(d.format("%Y-%m-%d").to_string()))),
            Value::Time(t) => {
                ColumnData::String(Some(Cow::Owned(t.format("%H:%M:%S%.f").to_string())))
            }
            Value::DateTime(dt) => ColumnData::String(Some(Cow::Owned(
                dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            ))),
            Value::DateTimeTz(dt) => ColumnData::String(Some(Cow::Owned(
                dt.format("%Y-%m-%dT%H:%M:%S%.f%:z").to_string(),
            ))),
            Value::Decimal(d) => ColumnData::String(Some(Cow::Owned(d.to_string()))),
            Value::Json(j) => ColumnData::String(Some(Cow::Owned(j.to_string()))),
        }
    }
}

fn param_refs<'a>(params: &'a [SqlParam<'a>]) -> Vec<&'a dyn tiberius::ToSql> {
    params.iter().map(|p| p as &dyn tiberius::ToSql).collect()
}

fn decode<'a, T: FromSql<'a>>(data: &'a ColumnData<'static>) -> Result<Option<T>> {
    T::from_sql(data).map_err(|e| Error::type_conversion(e.to_string()))
}

/// Convert one TDS column value to a ferry Value
fn column_data_to_value(data: ColumnData<'static>) -> Result<Value> {
    let value = match &data {
        ColumnData::U8(n) => n.map(|n| Value::Int16(i16::from(n))).unwrap_or(Value::Null),
        ColumnData::I16(n) => (*n).into(),
        ColumnData::I32(n) => (*n).into(),
        ColumnData::I64(n) => (*n).into(),
        ColumnData::F32(n) => n.map(Value::Float32).unwrap_or(Value::Null),
        ColumnData::F64(n) => (*n).into(),
        ColumnData::Bit(b) => (*b).into(),
        ColumnData::String(s) => s.as_ref().map(|s| Value::String(s.to_string())).unwrap_or(Value::Null),
        ColumnData::Guid(u) => (*u).into(),
        ColumnData::Binary(b) => b.as_ref().map(|b| Value::Bytes(b.to_vec())).unwrap_or(Value::Null),
        ColumnData::Numeric(n) => match n {
            Some(n) => rust_decimal::Decimal::try_from_i128_with_scale(n.value(), u32::from(n.scale()))
                .map(Value::Decimal)
                .unwrap_or_else(|_| Value::Float64(f64::from(*n))),
            None => Value::Null,
        },
        ColumnData::Xml(x) => x
            .as_ref()
            .map(|x| Value::String(x.clone().into_owned().into_string()))
            .unwrap_or(Value::Null),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            decode::<chrono::NaiveDateTime>(&data)?.into()
        }
        ColumnData::Date(_) => decode::<chrono::NaiveDate>(&data)?.into(),
        ColumnData::Time(_) => decode::<chrono::NaiveTime>(&data)?
            .map(Value::Time)
            .unwrap_or(Value::Null),
        ColumnData::DateTimeOffset(_) => decode::<chrono::DateTime<chrono::Utc>>(&data)?.into(),
    };
    Ok(value)
}

fn tiberius_row_to_row(columns: &[String], tib_row: tiberius::Row) -> Result<Row> {
    let values = tib_row
        .into_iter()
        .map(column_data_to_value)
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(columns.to_vec(), values))
}

fn map_tds_error(e: tiberius::error::Error, sql: &str) -> Error {
    match e {
        tiberius::error::Error::Server(token) => {
            Error::query_with_sql(format!("{} (error {})", token.message(), token.code()), sql)
        }
        other => Error::query_with_sql(other.to_string(), sql),
    }
}

async fn run_query(client: &mut TdsClient, sql: &str, params: &[Value]) -> Result<ResultSet> {
    let tib_params: Vec<SqlParam<'_>> = params.iter().map(SqlParam).collect();
    let refs = param_refs(&tib_params);

    let mut stream = client
        .query(sql, &refs)
        .await
        .map_err(|e| map_tds_error(e, sql))?;

    let columns: Vec<String> = stream
        .columns()
        .await
        .map_err(|e| map_tds_error(e, sql))?
        .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let tib_rows = stream
        .into_first_result()
        .await
        .map_err(|e| map_tds_error(e, sql))?;

    let rows = tib_rows
        .into_iter()
        .map(|r| tiberius_row_to_row(&columns, r))
        .collect::<Result<Vec<_>>>()?;
    Ok(ResultSet::new(columns, rows))
}

async fn run_execute(client: &mut TdsClient, sql: &str, params: &[Value]) -> Result<u64> {
    let tib_params: Vec<SqlParam<'_>> = params.iter().map(SqlParam).collect();
    let refs = param_refs(&tib_params);

    let result = client
        .execute(sql, &refs)
        .await
        .map_err(|e| map_tds_error(e, sql))?;
    Ok(result.total())
}

async fn run_simple(client: &mut TdsClient, sql: &str) -> Result<()> {
    client
        .simple_query(sql)
        .await
        .map_err(|e| Error::transaction(format!("{}: {}", sql, e)))?
        .into_results()
        .await
        .map_err(|e| Error::transaction(format!("{}: {}", sql, e)))?;
    Ok(())
}

/// Build a tiberius config from a connection URL and properties
fn tds_config(config: &ConnectionConfig) -> Result<Config> {
    let url = ConnectionUrl::parse(&config.url)?;

    let mut tib = Config::new();
    tib.host(&url.host);
    tib.port(url.port.unwrap_or(DatabaseType::SqlServer.default_port()));
    if !url.database.is_empty() {
        tib.database(&url.database);
    }
    tib.authentication(AuthMethod::sql_server(
        &url.username,
        url.password.as_deref().unwrap_or_default(),
    ));
    if let Some(app) = &config.application_name {
        tib.application_name(app);
    }

    let trust_from_url = url
        .param("trust_cert")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if trust_from_url || config.flag("trust_cert") {
        tib.trust_cert();
    }
    if let Some(driver) = url.param("driver") {
        debug!(driver, "ignoring ODBC driver qualifier for native TDS connection");
    }

    Ok(tib)
}

/// SQL Server connection
pub struct SqlServerConnection {
    client: Arc<Mutex<TdsClient>>,
}

impl SqlServerConnection {
    /// Open a new SQL Server connection
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let tib = tds_config(config)?;
        let addr = tib.get_addr();

        let handshake = async {
            let tcp = TcpStream::connect(&addr)
                .await
                .map_err(|e| Error::connection_with_source(format!("failed to reach {}", addr), e))?;
            tcp.set_nodelay(true).ok();

            Client::connect(tib, tcp.compat_write())
                .await
                .map_err(|e| match e {
                    tiberius::error::Error::Server(token) if token.code() == LOGIN_FAILED => {
                        Error::authentication(token.message().to_string())
                    }
                    other => Error::connection_with_source("TDS handshake failed", other),
                })
        };

        let client = if config.connect_timeout_ms > 0 {
            tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), handshake)
                .await
                .map_err(|_| {
                    Error::timeout(format!(
                        "connecting to {} took longer than {}ms",
                        addr, config.connect_timeout_ms
                    ))
                })??
        } else {
            handshake.await?
        };

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }
}

#[async_trait]
impl Connection for SqlServerConnection {
    async fn query_set(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let mut client = self.client.lock().await;
        run_query(&mut client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut client = self.client.lock().await;
        run_execute(&mut client, sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        {
            let mut client = self.client.lock().await;
            run_simple(&mut client, "BEGIN TRANSACTION").await?;
        }
        Ok(Box::new(SqlServerTransaction {
            client: Arc::clone(&self.client),
        }))
    }

    async fn is_valid(&self) -> bool {
        let mut client = self.client.lock().await;
        run_simple(&mut client, "SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        // the socket closes when the client is dropped
        Ok(())
    }
}

/// SQL Server transaction
pub struct SqlServerTransaction {
    client: Arc<Mutex<TdsClient>>,
}

#[async_trait]
impl Transaction for SqlServerTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut client = self.client.lock().await;
        run_execute(&mut client, sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut client = self.client.lock().await;
        run_simple(&mut client, "COMMIT TRANSACTION").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut client = self.client.lock().await;
        run_simple(&mut client, "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await
    }
}

/// SQL Server connection factory
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerConnectionFactory;

#[async_trait]
impl ConnectionFactory for SqlServerConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        Ok(Box::new(SqlServerConnection::connect(config).await?))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SqlServer
    }
}
