//! Unit tests for ferry-rdbc dialect module

use ferry_rdbc::connection::DatabaseType;
use ferry_rdbc::dialect::{dialect_for, PostgresDialect, SqlDialect, SqlServerDialect};
use ferry_rdbc::types::TableRef;

#[test]
fn test_postgres_quote_identifier() {
    let dialect = PostgresDialect;

    assert_eq!(dialect.quote_identifier("users"), "\"users\"");
    assert_eq!(dialect.quote_identifier("DisplayKey"), "\"DisplayKey\"");
    assert_eq!(dialect.quote_identifier("my\"table"), "\"my\"\"table\"");
}

#[test]
fn test_sqlserver_quote_identifier() {
    let dialect = SqlServerDialect;

    assert_eq!(dialect.quote_identifier("users"), "[users]");
    assert_eq!(dialect.quote_identifier("Display Key"), "[Display Key]");
    assert_eq!(dialect.quote_identifier("x]; DROP TABLE t --"), "[x]]; DROP TABLE t --]");
}

#[test]
fn test_placeholders() {
    assert_eq!(PostgresDialect.placeholder(10), "$10");
    assert_eq!(SqlServerDialect.placeholder(10), "@P10");
}

#[test]
fn test_insert_sql_parameter_count_matches_columns() {
    let table = TableRef::qualified("chest", "tb_keyValueData");
    let columns = [
        "DisplayKey",
        "Metadata",
        "Category",
        "Collection",
        "DisplayCategory",
        "DisplayCollection",
        "Keywords",
    ];

    for db in [DatabaseType::PostgreSQL, DatabaseType::SqlServer] {
        let dialect = dialect_for(db);
        let sql = dialect.insert_sql(&table, &columns);
        assert!(sql.starts_with("INSERT INTO"), "{sql}");
        assert!(sql.contains(&dialect.placeholder(columns.len())), "{sql}");
        assert!(!sql.contains(&dialect.placeholder(columns.len() + 1)), "{sql}");
        for col in columns {
            assert!(sql.contains(&dialect.quote_identifier(col)), "{sql}");
        }
    }
}

#[test]
fn test_table_exists_sql_is_escaped() {
    let table = TableRef::qualified("chest", "x' OR '1'='1");
    let sql = SqlServerDialect.table_exists_sql(&table);
    assert!(sql.contains("TABLE_NAME = 'x'' OR ''1''=''1'"));
}
