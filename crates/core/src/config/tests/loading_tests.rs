use crate::config::models::{AppConfig, StoreBackend};
use std::env;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(
        file,
        r#"
[store]
backend = "sqlite"
sqlite_url = "sqlite://loaded.db?mode=rwc"

[queue]
max_wait_seconds = 120
"#
    )
    .unwrap();

    let config = AppConfig::load(file.path().to_str()).unwrap();
    assert_eq!(config.store.backend, StoreBackend::Sqlite);
    assert_eq!(config.queue.max_wait_seconds, 120);
    assert_eq!(config.queue.priority_gap_seconds, 60);
}

#[test]
fn test_missing_file_is_an_error() {
    let result = AppConfig::load(Some("/definitely/not/here/taskqueue.toml"));
    assert!(result.is_err());
}

#[test]
fn test_environment_override() {
    let mut file = NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(file, "[recovery]\nheartbeat_interval_seconds = 10").unwrap();

    env::set_var("TASKQUEUE__RECOVERY__HEARTBEAT_MISS_FACTOR", "5");
    let config = AppConfig::load(file.path().to_str());
    env::remove_var("TASKQUEUE__RECOVERY__HEARTBEAT_MISS_FACTOR");

    let config = config.unwrap();
    assert_eq!(config.recovery.heartbeat_miss_factor, 5);
    assert_eq!(config.recovery.heartbeat_timeout().num_seconds(), 50);
}

#[test]
fn test_invalid_file_fails_validation() {
    let mut file = NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(file, "[worker]\ncapacity = 0").unwrap();

    let err = AppConfig::load(file.path().to_str()).unwrap_err();
    assert!(format!("{err:#}").contains("Worker"));
}
