//! SQL dialect abstraction for ferry-rdbc
//!
//! PostgreSQL statements are built with sea-query; SQL Server has no
//! sea-query backend, so its statements are assembled by hand with the
//! same quoting rules.

use crate::connection::DatabaseType;
use crate::security::escape_string_literal;
use crate::types::TableRef;
use sea_query::{Alias, Expr, IntoIden, PostgresQueryBuilder, Query, TableRef as SeaTableRef};

fn sea_table_ref(table: &TableRef) -> SeaTableRef {
    match &table.schema {
        Some(s) => SeaTableRef::SchemaTable(
            Alias::new(s.as_str()).into_iden(),
            Alias::new(table.name.as_str()).into_iden(),
        ),
        None => SeaTableRef::Table(Alias::new(table.name.as_str()).into_iden()),
    }
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Schema used when a table reference has none
    fn default_schema(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a 1-based parameter index (e.g., $1, @P1)
    fn placeholder(&self, index: usize) -> String;

    /// Quoted, schema-qualified table name
    fn qualified_table(&self, table: &TableRef) -> String {
        match &table.schema {
            Some(s) => format!(
                "{}.{}",
                self.quote_identifier(s),
                self.quote_identifier(&table.name)
            ),
            None => self.quote_identifier(&table.name),
        }
    }

    /// Single-row parameterized INSERT for the given columns
    fn insert_sql(&self, table: &TableRef, columns: &[&str]) -> String;

    /// A query returning one row whose first column is 1 when the table exists
    fn table_exists_sql(&self, table: &TableRef) -> String;
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn default_schema(&self) -> &'static str {
        "public"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn insert_sql(&self, table: &TableRef, columns: &[&str]) -> String {
        let col_idens: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();
        let values: Vec<_> = (1..=columns.len())
            .map(|i| Expr::cust(self.placeholder(i)))
            .collect();

        let mut stmt = Query::insert();
        stmt.into_table(sea_table_ref(table))
            .columns(col_idens)
            .values_panic(values);

        stmt.to_string(PostgresQueryBuilder)
    }

    fn table_exists_sql(&self, table: &TableRef) -> String {
        let schema = escape_string_literal(table.schema.as_deref().unwrap_or(self.default_schema()));
        let name = escape_string_literal(&table.name);
        format!(
            "SELECT CASE WHEN EXISTS(SELECT 1 FROM information_schema.tables WHERE table_schema = '{}' AND table_name = '{}') THEN 1 ELSE 0 END",
            schema, name
        )
    }
}

/// SQL Server dialect
#[derive(Debug, Clone, Default)]
pub struct SqlServerDialect;

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn default_schema(&self) -> &'static str {
        "dbo"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    fn insert_sql(&self, table: &TableRef, columns: &[&str]) -> String {
        let cols: Vec<String> = columns.iter().map(|c| self.quote_identifier(c)).collect();
        let params: Vec<String> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified_table(table),
            cols.join(", "),
            params.join(", ")
        )
    }

    fn table_exists_sql(&self, table: &TableRef) -> String {
        let schema = escape_string_literal(table.schema.as_deref().unwrap_or(self.default_schema()));
        let name = escape_string_literal(&table.name);
        format!(
            "SELECT CASE WHEN EXISTS(SELECT 1 FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}') THEN 1 ELSE 0 END",
            schema, name
        )
    }
}

/// Get the dialect for a database type
pub fn dialect_for(db: DatabaseType) -> Box<dyn SqlDialect> {
    match db {
        DatabaseType::PostgreSQL => Box::new(PostgresDialect),
        DatabaseType::SqlServer => Box::new(SqlServerDialect),
    }
}
