//! The shipped demo configuration must stay loadable.

use std::path::PathBuf;

use ferry_migrate::PipelineConfig;
use ferry_rdbc::connection::DatabaseType;

fn demo_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/chest-migration.yaml")
}

#[test]
fn test_demo_config_loads() {
    let config = PipelineConfig::from_file(demo_path()).unwrap();

    assert_eq!(config.source.database_type().unwrap(), DatabaseType::PostgreSQL);
    assert_eq!(config.destination.database_type().unwrap(), DatabaseType::SqlServer);
    assert_eq!(config.destination.driver.as_deref(), Some("SQL+Server"));
    assert_eq!(config.index_column, "key");
    assert_eq!(config.target_table().qualified_name(), "chest.tb_keyValueData");
    assert!(config.query.contains("FROM key_value_data"));
    assert_eq!(config.options.batch_size, 1000);
}
