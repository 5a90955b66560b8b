//! End-to-end pipeline behavior against in-memory databases.

use std::path::Path;
use std::sync::Arc;

use ferry_migrate::testing::MemoryDatabase;
use ferry_migrate::{
    ConnectError, EngineRegistry, ExportError, ImportError, Phase, Pipeline, PipelineConfig,
    PipelineError,
};
use ferry_rdbc::connection::DatabaseType;
use ferry_rdbc::types::{ResultSet, Row, TableRef};
use ferry_rdbc::Value;
use tempfile::TempDir;

const QUERY: &str = r#"SELECT key AS "Key", display_key AS "DisplayKey", category AS "Category" FROM key_value_data"#;

fn config(staging: &Path) -> PipelineConfig {
    let yaml = format!(
        r#"
source:
  kind: postgresql+psycopg2
  host: postgres.server.url
  port: 5432
  database: dbName
  username: username
  password: password
destination:
  kind: mssql+pyodbc
  host: mssql.server.url
  port: 1433
  database: dbName
  username: username
  password: password
  driver: SQL+Server
query: '{query}'
index_column: key
staging_path: {staging}
schema: chest
table: tb_keyValueData
options:
  batch_size: 2
"#,
        query = QUERY,
        staging = staging.display()
    );
    PipelineConfig::from_yaml_str(&yaml).unwrap()
}

fn target() -> TableRef {
    TableRef::qualified("chest", "tb_keyValueData")
}

fn source_rows(n: usize) -> ResultSet {
    let columns = vec![
        "DisplayKey".to_string(),
        "Key".to_string(),
        "Category".to_string(),
    ];
    let rows = (0..n)
        .map(|i| {
            Row::new(
                columns.clone(),
                vec![
                    Value::String(format!("Display {i}")),
                    Value::String(format!("key-{i}")),
                    if i % 2 == 0 {
                        Value::String("general".into())
                    } else {
                        Value::Null
                    },
                ],
            )
        })
        .collect();
    ResultSet::new(columns, rows)
}

struct Harness {
    _dir: TempDir,
    staging: std::path::PathBuf,
    source: MemoryDatabase,
    destination: MemoryDatabase,
}

impl Harness {
    fn new(rows: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("ChestDataFromPostgres.csv");
        Self {
            _dir: dir,
            staging,
            source: MemoryDatabase::new(DatabaseType::PostgreSQL)
                .with_query(QUERY, source_rows(rows)),
            destination: MemoryDatabase::new(DatabaseType::SqlServer).with_table(target()),
        }
    }

    fn registry(&self) -> EngineRegistry {
        EngineRegistry::empty()
            .with_factory(DatabaseType::PostgreSQL, Arc::new(self.source.clone()))
            .with_factory(DatabaseType::SqlServer, Arc::new(self.destination.clone()))
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(config(&self.staging)).with_registry(self.registry())
    }

    fn staged_lines(&self) -> Vec<String> {
        std::fs::read_to_string(&self.staging)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

#[tokio::test]
async fn test_run_moves_every_row() {
    let h = Harness::new(5);

    let report = h.pipeline().run().await.unwrap();

    assert_eq!(report.rows_exported, 5);
    assert_eq!(report.rows_imported, 5);
    assert_eq!(report.staging_path, h.staging);
    assert_eq!(report.table, "chest.tb_keyValueData");
    assert_eq!(h.staged_lines().len(), 6);
    assert_eq!(h.destination.row_count(&target()), 5);
    assert_eq!(h.destination.batch_sizes(), vec![2, 2, 1]);
}

#[tokio::test]
async fn test_index_column_leads_file_and_is_not_imported() {
    let h = Harness::new(2);

    h.pipeline().run().await.unwrap();

    let lines = h.staged_lines();
    assert_eq!(lines[0], "Key,DisplayKey,Category");
    assert_eq!(lines[1], "key-0,Display 0,general");
    assert_eq!(lines[2], "key-1,Display 1,");

    let rows = h.destination.rows(&target());
    assert_eq!(
        rows[0],
        vec![
            Value::String("Display 0".into()),
            Value::String("general".into())
        ]
    );
    assert_eq!(rows[1], vec![Value::String("Display 1".into()), Value::Null]);
}

#[tokio::test]
async fn test_rerun_appends_duplicates() {
    let h = Harness::new(3);
    let pipeline = h.pipeline();

    pipeline.run().await.unwrap();
    pipeline.run().await.unwrap();

    let rows = h.destination.rows(&target());
    assert_eq!(rows.len(), 6);
    assert_eq!(rows[0], rows[3]);
}

#[tokio::test]
async fn test_zero_rows_yields_header_only_file() {
    let h = Harness::new(0);

    let report = h.pipeline().run().await.unwrap();

    assert_eq!(report.rows_exported, 0);
    assert_eq!(report.rows_imported, 0);
    assert_eq!(h.staged_lines(), vec!["Key,DisplayKey,Category".to_string()]);
    assert_eq!(h.destination.row_count(&target()), 0);
}

#[tokio::test]
async fn test_invalid_source_creates_no_file() {
    let h = Harness::new(3);
    let mut config = config(&h.staging);
    config.source.kind = "oracle+cx_oracle".into();

    let err = Pipeline::new(config)
        .with_registry(h.registry())
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Phase::ConnectSource);
    assert!(matches!(
        err,
        PipelineError::SourceConnect(ConnectError::InvalidDescriptor(_))
    ));
    assert!(!h.staging.exists());
    assert_eq!(h.destination.row_count(&target()), 0);
    assert_eq!(h.destination.connect_count(), 0);
}

#[tokio::test]
async fn test_unreachable_source_creates_no_file() {
    let mut h = Harness::new(3);
    h.source = h.source.clone().fail_connect("could not connect to server");

    let err = h.pipeline().run().await.unwrap_err();

    assert_eq!(err.phase(), Phase::ConnectSource);
    assert!(!h.staging.exists());
    assert_eq!(h.destination.row_count(&target()), 0);
}

#[tokio::test]
async fn test_missing_index_column_is_export_failure() {
    let h = Harness::new(3);
    let mut config = config(&h.staging);
    config.index_column = "id".into();

    let err = Pipeline::new(config)
        .with_registry(h.registry())
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Phase::Export);
    assert!(matches!(
        err,
        PipelineError::Export(ExportError::IndexColumnNotFound { .. })
    ));
    assert!(err.to_string().starts_with("error exporting data to CSV"));
    assert!(!h.staging.exists());
}

#[tokio::test]
async fn test_destination_failure_leaves_staging_file() {
    let mut h = Harness::new(3);
    h.destination = h.destination.clone().fail_connect("login failed for user");

    let err = h.pipeline().run().await.unwrap_err();

    assert_eq!(err.phase(), Phase::ConnectDestination);
    assert!(h.staging.exists());
    assert_eq!(h.staged_lines().len(), 4);
}

#[tokio::test]
async fn test_malformed_staging_file_leaves_table_unchanged() {
    let h = Harness::new(0);
    std::fs::write(&h.staging, "Key,DisplayKey,Category\nk1,d1,c1\nk2,d2\n").unwrap();

    let err = h.pipeline().import().await.unwrap_err();

    assert_eq!(err.phase(), Phase::Import);
    assert!(matches!(
        err,
        PipelineError::Import(ImportError::Malformed { line: 3, .. })
    ));
    assert!(err.to_string().starts_with("error loading data from CSV"));
    assert_eq!(h.destination.row_count(&target()), 0);
}

#[tokio::test]
async fn test_export_then_import_separately() {
    let h = Harness::new(4);
    let pipeline = h.pipeline();

    let exported = pipeline.export().await.unwrap();
    assert_eq!(exported.rows, 4);
    assert_eq!(h.destination.connect_count(), 0);

    let imported = pipeline.import().await.unwrap();
    assert_eq!(imported.rows, 4);
    assert_eq!(imported.columns, vec!["DisplayKey", "Category"]);
}

#[tokio::test]
async fn test_transactional_import_is_all_or_nothing() {
    let h = Harness::new(5);
    let mut config = config(&h.staging);
    config.options.transactional = true;
    h.destination.fail_inserts_after(3);

    let err = Pipeline::new(config)
        .with_registry(h.registry())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Import(ImportError::Insert { .. })
    ));
    assert_eq!(h.destination.row_count(&target()), 0);
}

#[tokio::test]
async fn test_check_reports_table() {
    let h = Harness::new(0);

    let report = h.pipeline().check().await.unwrap();

    assert!(report.table_exists);
    assert_eq!(report.table, "chest.tb_keyValueData");
    assert!(!report.source.contains(":password@"));
    assert!(!report.destination.contains(":password@"));
}
