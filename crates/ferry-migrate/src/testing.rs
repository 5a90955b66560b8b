//! In-memory database for tests
//!
//! [`MemoryDatabase`] implements [`ConnectionFactory`] without a server.
//! Queries are answered from canned result sets, and `INSERT` statements
//! generated by the backend's dialect are appended to registered tables.
//! Failures can be injected at connect time or after a number of inserts.
//!
//! # Example
//!
//! ```rust,ignore
//! use ferry_migrate::testing::MemoryDatabase;
//!
//! let source = MemoryDatabase::new(DatabaseType::PostgreSQL)
//!     .with_query("SELECT key, value FROM kv", result_set);
//! let dest = MemoryDatabase::new(DatabaseType::SqlServer)
//!     .with_table(TableRef::qualified("chest", "tb_keyValueData"));
//!
//! let registry = EngineRegistry::empty()
//!     .with_factory(DatabaseType::PostgreSQL, Arc::new(source.clone()))
//!     .with_factory(DatabaseType::SqlServer, Arc::new(dest.clone()));
//!
//! Pipeline::new(config).with_registry(registry).run().await?;
//! assert_eq!(dest.row_count(&TableRef::qualified("chest", "tb_keyValueData")), 2);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ferry_rdbc::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Transaction,
};
use ferry_rdbc::dialect::dialect_for;
use ferry_rdbc::error::{Error, Result};
use ferry_rdbc::types::{ResultSet, Row, TableRef};
use ferry_rdbc::Value;
use parking_lot::Mutex;

#[derive(Default)]
struct State {
    queries: HashMap<String, ResultSet>,
    tables: Vec<MemoryTable>,
    connect_failure: Option<String>,
    fail_inserts_after: Option<u64>,
    inserts_attempted: u64,
    statements: u64,
    batch_sizes: Vec<usize>,
    connects: usize,
}

struct MemoryTable {
    table: TableRef,
    insert_prefix: String,
    exists_sql: String,
    rows: Vec<Vec<Value>>,
}

/// Shared in-memory database; clones see the same state
#[derive(Clone)]
pub struct MemoryDatabase {
    database_type: DatabaseType,
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    /// Empty database speaking the dialect of `database_type`
    pub fn new(database_type: DatabaseType) -> Self {
        Self {
            database_type,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Answer `sql` with `result`
    pub fn with_query(self, sql: impl Into<String>, result: ResultSet) -> Self {
        self.state.lock().queries.insert(sql.into(), result);
        self
    }

    /// Create an empty table that accepts inserts
    pub fn with_table(self, table: TableRef) -> Self {
        let dialect = dialect_for(self.database_type);
        let insert_prefix = format!("INSERT INTO {} ", dialect.qualified_table(&table));
        let exists_sql = dialect.table_exists_sql(&table);
        self.state.lock().tables.push(MemoryTable {
            table,
            insert_prefix,
            exists_sql,
            rows: Vec::new(),
        });
        self
    }

    /// Refuse every connection attempt
    pub fn fail_connect(self, message: impl Into<String>) -> Self {
        self.state.lock().connect_failure = Some(message.into());
        self
    }

    /// Let `n` more inserts succeed, then fail every following one
    pub fn fail_inserts_after(&self, n: u64) {
        let mut state = self.state.lock();
        state.fail_inserts_after = Some(state.inserts_attempted + n);
    }

    /// Committed rows of `table`
    pub fn rows(&self, table: &TableRef) -> Vec<Vec<Value>> {
        self.state
            .lock()
            .tables
            .iter()
            .find(|t| &t.table == table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Number of committed rows in `table`
    pub fn row_count(&self, table: &TableRef) -> usize {
        self.rows(table).len()
    }

    /// Statements executed successfully, inside or outside transactions
    pub fn statement_count(&self) -> u64 {
        self.state.lock().statements
    }

    /// Size of every batch received, in order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    /// Successful connections opened so far
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    fn query_set(&self, sql: &str) -> Result<ResultSet> {
        let state = self.state.lock();
        if let Some(result) = state.queries.get(sql) {
            return Ok(result.clone());
        }
        if state.tables.iter().any(|t| t.exists_sql == sql) {
            let columns = vec!["exists".to_string()];
            let row = Row::new(columns.clone(), vec![Value::Int32(1)]);
            return Ok(ResultSet::new(columns, vec![row]));
        }
        Err(Error::query_with_sql("no canned result for query", sql))
    }

    /// Validate an insert and return the index of its target table
    fn check_insert(&self, sql: &str) -> Result<usize> {
        let mut state = self.state.lock();
        let index = state
            .tables
            .iter()
            .position(|t| sql.starts_with(&t.insert_prefix))
            .ok_or_else(|| Error::TableNotFound {
                table: sql
                    .trim_start_matches("INSERT INTO ")
                    .split(" (")
                    .next()
                    .unwrap_or_default()
                    .to_string(),
            })?;

        if let Some(limit) = state.fail_inserts_after {
            if state.inserts_attempted >= limit {
                return Err(Error::query_with_sql("injected insert failure", sql));
            }
        }
        state.inserts_attempted += 1;
        state.statements += 1;
        Ok(index)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        if !sql.starts_with("INSERT INTO ") {
            self.state.lock().statements += 1;
            return Ok(0);
        }
        let index = self.check_insert(sql)?;
        self.state.lock().tables[index].rows.push(params.to_vec());
        Ok(1)
    }

    fn record_batch(&self, size: usize) {
        self.state.lock().batch_sizes.push(size);
    }
}

#[async_trait]
impl ConnectionFactory for MemoryDatabase {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut state = self.state.lock();
        if let Some(message) = &state.connect_failure {
            return Err(Error::connection(message.clone()));
        }
        state.connects += 1;
        Ok(Box::new(MemoryConnection {
            db: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn database_type(&self) -> DatabaseType {
        self.database_type
    }
}

struct MemoryConnection {
    db: MemoryDatabase,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query_set(&self, sql: &str, _params: &[Value]) -> Result<ResultSet> {
        self.ensure_open()?;
        self.db.query_set(sql)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        self.db.execute(sql, params)
    }

    async fn execute_batch(&self, statements: &[(&str, &[Value])]) -> Result<Vec<u64>> {
        self.ensure_open()?;
        self.db.record_batch(statements.len());
        statements
            .iter()
            .map(|(sql, params)| self.db.execute(sql, params))
            .collect()
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        Ok(Box::new(MemoryTransaction {
            db: self.db.clone(),
            pending: Mutex::new(Vec::new()),
        }))
    }

    async fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryTransaction {
    db: MemoryDatabase,
    pending: Mutex<Vec<(usize, Vec<Value>)>>,
}

impl MemoryTransaction {
    fn stage(&self, sql: &str, params: &[Value]) -> Result<u64> {
        if !sql.starts_with("INSERT INTO ") {
            self.db.state.lock().statements += 1;
            return Ok(0);
        }
        let index = self.db.check_insert(sql)?;
        self.pending.lock().push((index, params.to_vec()));
        Ok(1)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.stage(sql, params)
    }

    async fn execute_batch(&self, statements: &[(&str, &[Value])]) -> Result<Vec<u64>> {
        self.db.record_batch(statements.len());
        statements
            .iter()
            .map(|(sql, params)| self.stage(sql, params))
            .collect()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut state = self.db.state.lock();
        for (index, row) in pending {
            state.tables[index].rows.push(row);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.pending.lock().clear();
        Ok(())
    }
}
