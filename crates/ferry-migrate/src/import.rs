//! Importer: staging file to destination table
//!
//! The file is read and validated in full before anything is sent, so a
//! malformed file never leaves a partial append behind. Rows are then
//! sent as parameterized `INSERT` statements in batches.

use std::path::Path;

use ferry_rdbc::connection::Connection;
use ferry_rdbc::dialect::SqlDialect;
use ferry_rdbc::security::validate_sql_identifier;
use ferry_rdbc::types::TableRef;
use ferry_rdbc::Value;
use tracing::{debug, info, warn};

use crate::config::PipelineOptions;
use crate::error::ImportError;
use crate::staging::{read_staging, ColumnKind};

/// Import tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    /// Statements per batch
    pub batch_size: usize,
    /// Wrap the whole append in one transaction
    pub transactional: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            transactional: false,
        }
    }
}

impl From<&PipelineOptions> for ImportOptions {
    fn from(options: &PipelineOptions) -> Self {
        Self {
            batch_size: options.batch_size,
            transactional: options.transactional,
        }
    }
}

/// Outcome of a successful import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    /// Rows appended
    pub rows: u64,
    /// Destination columns, in file order
    pub columns: Vec<String>,
    /// Qualified destination table
    pub table: String,
    /// Batches sent
    pub batches: usize,
}

/// Rows and INSERT text ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedImport {
    /// Destination columns (index column dropped)
    pub columns: Vec<String>,
    /// Inferred kind per destination column
    pub kinds: Vec<ColumnKind>,
    /// Parameterized single-row INSERT
    pub sql: String,
    /// One parameter list per row
    pub rows: Vec<Vec<Value>>,
}

/// Read, validate and convert the staging file without touching the database.
///
/// The leading index column is dropped. Every record must have as many
/// fields as the header.
pub fn prepare_import(
    dialect: &dyn SqlDialect,
    table: &TableRef,
    path: &Path,
) -> Result<PreparedImport, ImportError> {
    if let Some(schema) = &table.schema {
        validate_sql_identifier(schema).map_err(ImportError::InvalidTarget)?;
    }
    validate_sql_identifier(&table.name).map_err(ImportError::InvalidTarget)?;

    let staged = read_staging(path).map_err(|source| ImportError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let width = staged.header.len();
    if width < 2 {
        return Err(ImportError::NoColumns {
            path: path.to_path_buf(),
        });
    }

    if let Some(bad) = staged.records.iter().find(|r| r.fields.len() != width) {
        return Err(ImportError::Malformed {
            path: path.to_path_buf(),
            line: bad.line,
            expected: width,
            found: bad.fields.len(),
        });
    }

    let columns: Vec<String> = staged.header[1..].to_vec();
    let kinds: Vec<ColumnKind> = (1..width)
        .map(|c| ColumnKind::infer(staged.records.iter().map(|r| r.fields[c].as_str())))
        .collect();

    let rows: Vec<Vec<Value>> = staged
        .records
        .iter()
        .map(|r| {
            kinds
                .iter()
                .zip(&r.fields[1..])
                .map(|(kind, field)| kind.to_value(field))
                .collect()
        })
        .collect();

    let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();
    let sql = dialect.insert_sql(table, &column_refs);

    debug!(columns = ?columns, kinds = ?kinds, rows = rows.len(), "Staging file validated");

    Ok(PreparedImport {
        columns,
        kinds,
        sql,
        rows,
    })
}

/// Append every row of the staging file at `path` to `table`.
///
/// The table must already exist; no DDL is issued.
pub async fn import_from_csv(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    table: &TableRef,
    path: &Path,
    options: ImportOptions,
) -> Result<ImportSummary, ImportError> {
    let prepared = prepare_import(dialect, table, path)?;
    let table_name = table.qualified_name();
    let batch_size = options.batch_size.max(1);

    if prepared.rows.is_empty() {
        info!(table = %table_name, "Staging file has no rows, nothing to append");
        return Ok(ImportSummary {
            rows: 0,
            columns: prepared.columns,
            table: table_name,
            batches: 0,
        });
    }

    let (rows, batches) = if options.transactional {
        send_in_transaction(conn, &prepared, &table_name, batch_size).await?
    } else {
        send(conn, &prepared, &table_name, batch_size).await?
    };

    info!(table = %table_name, rows, batches, "Appended rows from CSV");

    Ok(ImportSummary {
        rows,
        columns: prepared.columns,
        table: table_name,
        batches,
    })
}

fn statements<'a>(sql: &'a str, chunk: &'a [Vec<Value>]) -> Vec<(&'a str, &'a [Value])> {
    chunk.iter().map(|p| (sql, p.as_slice())).collect()
}

async fn send(
    conn: &dyn Connection,
    prepared: &PreparedImport,
    table: &str,
    batch_size: usize,
) -> Result<(u64, usize), ImportError> {
    let mut sent = 0u64;
    let mut batches = 0usize;

    for chunk in prepared.rows.chunks(batch_size) {
        conn.execute_batch(&statements(&prepared.sql, chunk))
            .await
            .map_err(|source| ImportError::Insert {
                table: table.to_string(),
                rows_sent: sent,
                source,
            })?;
        sent += chunk.len() as u64;
        batches += 1;
        debug!(table, rows = sent, "Batch appended");
    }

    Ok((sent, batches))
}

async fn send_in_transaction(
    conn: &dyn Connection,
    prepared: &PreparedImport,
    table: &str,
    batch_size: usize,
) -> Result<(u64, usize), ImportError> {
    let tx = conn
        .begin()
        .await
        .map_err(|source| ImportError::Transaction {
            table: table.to_string(),
            source,
        })?;

    let mut sent = 0u64;
    let mut batches = 0usize;

    for chunk in prepared.rows.chunks(batch_size) {
        let outcome = tx.execute_batch(&statements(&prepared.sql, chunk)).await;
        if let Err(source) = outcome {
            if let Err(e) = tx.rollback().await {
                warn!(table, error = %e, "Rollback after failed batch also failed");
            }
            return Err(ImportError::Insert {
                table: table.to_string(),
                rows_sent: sent,
                source,
            });
        }
        sent += chunk.len() as u64;
        batches += 1;
    }

    tx.commit()
        .await
        .map_err(|source| ImportError::Transaction {
            table: table.to_string(),
            source,
        })?;

    Ok((sent, batches))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDatabase;
    use ferry_rdbc::connection::{ConnectionConfig, ConnectionFactory, DatabaseType};
    use ferry_rdbc::dialect::SqlServerDialect;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn table() -> TableRef {
        TableRef::qualified("chest", "tb_keyValueData")
    }

    fn stage(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("stage.csv");
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn setup() -> (MemoryDatabase, Box<dyn Connection>) {
        let db = MemoryDatabase::new(DatabaseType::SqlServer).with_table(table());
        let conn = db
            .connect(&ConnectionConfig::new("mssql://memory/db"))
            .await
            .unwrap();
        (db, conn)
    }

    #[test]
    fn test_prepare_drops_index_and_infers() {
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "key,Count,Ratio,Active,Name\nk1,1,0.5,true,a\nk2,,2,false,\n");

        let prepared = prepare_import(&SqlServerDialect, &table(), &path).unwrap();
        assert_eq!(prepared.columns, vec!["Count", "Ratio", "Active", "Name"]);
        assert_eq!(
            prepared.kinds,
            vec![
                ColumnKind::Integer,
                ColumnKind::Float,
                ColumnKind::Boolean,
                ColumnKind::Text
            ]
        );
        assert_eq!(
            prepared.sql,
            "INSERT INTO [chest].[tb_keyValueData] ([Count], [Ratio], [Active], [Name]) VALUES (@P1, @P2, @P3, @P4)"
        );
        assert_eq!(
            prepared.rows[1],
            vec![Value::Null, Value::Float64(2.0), Value::Bool(false), Value::Null]
        );
    }

    #[test]
    fn test_prepare_rejects_bad_identifier() {
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "key,a\n1,2\n");
        let bad = TableRef::qualified("chest", "t; DROP TABLE x");
        assert!(matches!(
            prepare_import(&SqlServerDialect, &bad, &path),
            Err(ImportError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_prepare_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope.csv");
        assert!(matches!(
            prepare_import(&SqlServerDialect, &table(), &path),
            Err(ImportError::Read { .. })
        ));
    }

    #[test]
    fn test_prepare_requires_data_columns() {
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "key\n1\n");
        assert!(matches!(
            prepare_import(&SqlServerDialect, &table(), &path),
            Err(ImportError::NoColumns { .. })
        ));

        let path = stage(&dir, "");
        assert!(matches!(
            prepare_import(&SqlServerDialect, &table(), &path),
            Err(ImportError::NoColumns { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_file_appends_nothing() {
        let (db, conn) = setup().await;
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "key,a,b\n1,x,y\n2,z\n3,u,v\n");

        let err = import_from_csv(
            conn.as_ref(),
            &SqlServerDialect,
            &table(),
            &path,
            ImportOptions::default(),
        )
        .await
        .unwrap_err();

        match err {
            ImportError::Malformed {
                line,
                expected,
                found,
                ..
            } => {
                assert_eq!(line, 3);
                assert_eq!(expected, 3);
                assert_eq!(found, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(db.row_count(&table()), 0);
        assert_eq!(db.statement_count(), 0);
    }

    #[tokio::test]
    async fn test_rows_sent_in_batches() {
        let (db, conn) = setup().await;
        let dir = TempDir::new().unwrap();
        let mut content = String::from("key,v\n");
        for i in 0..5 {
            content.push_str(&format!("{i},{}\n", i * 10));
        }
        let path = stage(&dir, &content);

        let summary = import_from_csv(
            conn.as_ref(),
            &SqlServerDialect,
            &table(),
            &path,
            ImportOptions {
                batch_size: 2,
                transactional: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(summary.rows, 5);
        assert_eq!(summary.batches, 3);
        assert_eq!(db.batch_sizes(), vec![2, 2, 1]);
        assert_eq!(db.rows(&table())[4], vec![Value::Int64(40)]);
    }

    #[tokio::test]
    async fn test_header_only_appends_zero_rows() {
        let (db, conn) = setup().await;
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "key,a,b\n");

        let summary = import_from_csv(
            conn.as_ref(),
            &SqlServerDialect,
            &table(),
            &path,
            ImportOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.rows, 0);
        assert_eq!(db.row_count(&table()), 0);
    }

    #[tokio::test]
    async fn test_non_transactional_failure_keeps_earlier_batches() {
        let (db, conn) = setup().await;
        db.fail_inserts_after(3);
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "key,v\n1,a\n2,b\n3,c\n4,d\n5,e\n");

        let err = import_from_csv(
            conn.as_ref(),
            &SqlServerDialect,
            &table(),
            &path,
            ImportOptions {
                batch_size: 2,
                transactional: false,
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ImportError::Insert { rows_sent: 2, .. }));
        assert_eq!(db.row_count(&table()), 3);
    }

    #[tokio::test]
    async fn test_transactional_failure_appends_nothing() {
        let (db, conn) = setup().await;
        db.fail_inserts_after(3);
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "key,v\n1,a\n2,b\n3,c\n4,d\n5,e\n");

        let err = import_from_csv(
            conn.as_ref(),
            &SqlServerDialect,
            &table(),
            &path,
            ImportOptions {
                batch_size: 2,
                transactional: true,
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ImportError::Insert { .. }));
        assert_eq!(db.row_count(&table()), 0);
    }

    #[tokio::test]
    async fn test_transactional_success_commits() {
        let (db, conn) = setup().await;
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "key,v\n1,a\n2,b\n");

        let summary = import_from_csv(
            conn.as_ref(),
            &SqlServerDialect,
            &table(),
            &path,
            ImportOptions {
                batch_size: 10,
                transactional: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(summary.rows, 2);
        assert_eq!(db.row_count(&table()), 2);
    }

    #[tokio::test]
    async fn test_missing_table_is_insert_error() {
        let db = MemoryDatabase::new(DatabaseType::SqlServer);
        let conn = db
            .connect(&ConnectionConfig::new("mssql://memory/db"))
            .await
            .unwrap();
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "key,v\n1,a\n");

        let err = import_from_csv(
            conn.as_ref(),
            &SqlServerDialect,
            &table(),
            &path,
            ImportOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ImportError::Insert { rows_sent: 0, .. }));
    }
}
