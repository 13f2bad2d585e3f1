//! Environment override tests, isolated in their own binary because the
//! variables are process-global. Run as a single test so the overrides
//! never race each other.

use pg2many_lib::config;
use std::time::Duration;

#[test]
fn test_env_overrides() {
    let path = std::env::temp_dir().join(format!(
        "pg2many_test_env_override_{}.yaml",
        std::process::id()
    ));
    std::fs::write(
        &path,
        r#"
source:
  connection_string: postgres://repl@localhost/app
  slot_name: from_file
targets:
  postgres:
    - name: tx
      connection_string: postgres://sink@localhost/tx
telemetry:
  address: ":9090"
"#,
    )
    .unwrap();

    // Scalar options are overridable through REPLICATOR_* variables
    std::env::set_var("REPLICATOR_SOURCE_SLOT_NAME", "from_env");
    std::env::set_var("REPLICATOR_PIPELINE_BATCH_INTERVAL", "3s");
    std::env::set_var("REPLICATOR_PIPELINE_WORKER_COUNT", "16");
    std::env::set_var("REPLICATOR_TELEMETRY_ADDRESS", ":9200");

    let config = config::load(Some(&path)).unwrap();
    assert_eq!(config.source.slot_name, "from_env");
    assert_eq!(config.pipeline.batch_interval, Duration::from_secs(3));
    assert_eq!(config.pipeline.worker_count, 16);
    assert_eq!(config.telemetry.address, ":9200");

    std::env::remove_var("REPLICATOR_SOURCE_SLOT_NAME");
    std::env::remove_var("REPLICATOR_PIPELINE_BATCH_INTERVAL");
    std::env::remove_var("REPLICATOR_PIPELINE_WORKER_COUNT");
    std::env::remove_var("REPLICATOR_TELEMETRY_ADDRESS");

    // A malformed override is a configuration error, not a silent default
    std::env::set_var("REPLICATOR_PIPELINE_BUFFER_SIZE", "lots");
    let err = config::load(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("pipeline.buffer_size"));
    std::env::remove_var("REPLICATOR_PIPELINE_BUFFER_SIZE");

    std::fs::remove_file(&path).unwrap();
}
