//! Configuration loading tests: file parsing, default fill-in,
//! environment overrides and validation.

use pg2many_lib::config;
use std::path::PathBuf;
use std::time::Duration;

fn write_config(test_name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "pg2many_test_{}_{}.yaml",
        test_name,
        std::process::id()
    ));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_load_full_config() {
    let path = write_config(
        "full",
        r#"
source:
  connection_string: postgres://repl:pw@localhost:5432/app
  slot_name: replicator_slot
  publication: replicator_pub
targets:
  postgres:
    - name: warehouse
      connection_string: postgres://sink:pw@localhost:5433/warehouse
      batch_size: 500
      batch_interval: 2s
      retry:
        max_attempts: 5
        backoff: 50ms
  clickhouse:
    - name: analytics
      connection_string: http://localhost:8123/analytics
  redis:
    - name: cache
      connection_string: redis://localhost:6379/0
      key_pattern: "users:{id}"
pipeline:
  worker_count: 8
  buffer_size: 5000
  batch_size: 250
  batch_interval: 500ms
telemetry:
  address: ":9100"
"#,
    );

    let config = config::load(Some(&path)).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.source.slot_name, "replicator_slot");
    assert_eq!(config.source.publication, "replicator_pub");
    assert_eq!(config.pipeline.worker_count, 8);
    assert_eq!(config.pipeline.batch_interval, Duration::from_millis(500));
    assert_eq!(config.telemetry.address, ":9100");

    let pg = &config.targets.postgres[0];
    assert_eq!(pg.base.name, "warehouse");
    assert_eq!(pg.base.batch_size, 500);
    assert_eq!(pg.base.batch_interval, Some(Duration::from_secs(2)));
    assert_eq!(pg.base.retry.max_attempts(), 5);
    assert_eq!(pg.base.retry.backoff(), Duration::from_millis(50));

    assert_eq!(config.targets.redis[0].key_pattern, "users:{id}");
}

#[test]
fn test_default_fill_in_per_sink_kind() {
    let path = write_config(
        "defaults",
        r#"
source:
  connection_string: postgres://repl@localhost/app
  slot_name: slot
targets:
  postgres:
    - name: tx
      connection_string: postgres://sink@localhost/tx
  clickhouse:
    - name: analytics
      connection_string: http://localhost:8123/analytics
"#,
    );

    let config = config::load(Some(&path)).unwrap();
    std::fs::remove_file(&path).unwrap();

    // A columnar target with no batch settings gets 5000 / 2s
    let ch = &config.targets.clickhouse[0].base;
    assert_eq!(ch.batch_size, 5_000);
    assert_eq!(ch.batch_interval, Some(Duration::from_secs(2)));

    // A transactional target defaults to 1000 / 1s
    let pg = &config.targets.postgres[0].base;
    assert_eq!(pg.batch_size, 1_000);
    assert_eq!(pg.batch_interval, Some(Duration::from_secs(1)));

    // Retry defaults
    assert_eq!(pg.retry.max_attempts(), 3);
    assert_eq!(pg.retry.backoff(), Duration::from_millis(100));

    // Pipeline and telemetry defaults
    assert_eq!(config.pipeline.worker_count, 4);
    assert_eq!(config.pipeline.buffer_size, 10_000);
    assert_eq!(config.pipeline.batch_size, 1_000);
    assert_eq!(config.pipeline.batch_interval, Duration::from_secs(1));
    assert_eq!(config.telemetry.address, ":9090");
}

#[test]
fn test_missing_source_connection_string_fails() {
    let path = write_config(
        "no_source",
        r#"
source:
  slot_name: slot
targets:
  postgres:
    - name: tx
      connection_string: postgres://sink@localhost/tx
"#,
    );

    let err = config::load(Some(&path)).unwrap_err();
    std::fs::remove_file(&path).unwrap();
    assert!(err.to_string().contains("source.connection_string"));
}

#[test]
fn test_no_targets_fails() {
    let path = write_config(
        "no_targets",
        r#"
source:
  connection_string: postgres://repl@localhost/app
  slot_name: slot
"#,
    );

    let err = config::load(Some(&path)).unwrap_err();
    std::fs::remove_file(&path).unwrap();
    assert!(err.to_string().contains("at least one target"));
}

#[test]
fn test_unparseable_file_fails() {
    let path = write_config("garbage", "{{{ this is not yaml");
    let result = config::load(Some(&path));
    std::fs::remove_file(&path).unwrap();
    assert!(result.is_err());
}

#[test]
fn test_missing_file_fails() {
    let err = config::load(Some(std::path::Path::new(
        "/nonexistent/pg2many/config.yaml",
    )))
    .unwrap_err();
    assert!(err.to_string().contains("failed to read"));
}

