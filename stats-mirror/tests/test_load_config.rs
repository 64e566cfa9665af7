use serial_test::serial;
use std::env;
use std::fs::write;
use tempfile::NamedTempFile;

use stats_mirror::load_config::{load_config, DATABASE_URL_ENV};
use stats_mirror_core::config::SyncSettings;

fn config_file(yaml: &str) -> NamedTempFile {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), yaml).unwrap();
    config_file
}

/// Every section spelled out ends up in the typed config.
#[tokio::test]
#[serial]
async fn test_load_config_reads_all_sections() {
    env::remove_var(DATABASE_URL_ENV);
    let config_file = config_file(
        r#"
database:
  url: "sqlite:///var/lib/stats-mirror/mirror.db"
remote:
  base_url: "https://mirror.example.test"
  include_english: false
  accept_invalid_certs: false
  timeout_secs: 5
sync:
  request_delay_ms: 500
  retry_attempts: 5
  retry_delay_ms: 1000
  max_depth: 8
"#,
    );

    let config = load_config(config_file.path()).expect("Config should load");

    assert_eq!(config.database.url, "sqlite:///var/lib/stats-mirror/mirror.db");
    assert_eq!(config.remote.base_url, "https://mirror.example.test");
    assert!(!config.remote.include_english);
    assert!(!config.remote.accept_invalid_certs);
    assert_eq!(config.remote.timeout_secs, 5);
    assert_eq!(config.sync.request_delay_ms, 500);
    assert_eq!(config.sync.retry_attempts, 5);
    assert_eq!(config.sync.retry_delay_ms, 1000);
    assert_eq!(config.sync.max_depth, 8);
}

/// Omitted sections and fields fall back to their defaults.
#[tokio::test]
#[serial]
async fn test_load_config_fills_defaults() {
    env::remove_var(DATABASE_URL_ENV);
    let config_file = config_file("sync:\n  max_depth: 4\n");

    let config = load_config(config_file.path()).expect("Config should load");

    assert_eq!(config.database.url, "sqlite://stats-mirror.db");
    assert_eq!(config.remote.base_url, "https://data.stats.gov.cn");
    assert!(config.remote.include_english);
    assert_eq!(
        config.sync,
        SyncSettings {
            max_depth: 4,
            ..SyncSettings::default()
        }
    );
}

#[tokio::test]
#[serial]
async fn test_load_config_database_url_from_env() {
    let config_file = config_file("database:\n  url: \"sqlite://from-file.db\"\n");

    env::set_var(DATABASE_URL_ENV, "sqlite://from-env.db");
    let config = load_config(config_file.path());
    env::remove_var(DATABASE_URL_ENV);

    assert_eq!(config.unwrap().database.url, "sqlite://from-env.db");
}

#[tokio::test]
#[serial]
async fn test_load_config_blank_env_is_ignored() {
    let config_file = config_file("database:\n  url: \"sqlite://from-file.db\"\n");

    env::set_var(DATABASE_URL_ENV, "  ");
    let config = load_config(config_file.path());
    env::remove_var(DATABASE_URL_ENV);

    assert_eq!(config.unwrap().database.url, "sqlite://from-file.db");
}

/// This test ensures that if the config file is not valid YAML, load_config errors and reports as such.
#[tokio::test]
#[serial]
async fn test_load_config_errors_for_invalid_file() {
    let config_file = config_file("not-yaml: [:::");

    let err = load_config(config_file.path()).unwrap_err();
    let msg = err.to_string();
    assert!(
        msg.contains("parse") || msg.contains("YAML"),
        "Parse error expected, got: {msg}"
    );
}

#[tokio::test]
#[serial]
async fn test_load_config_errors_for_wrong_field_type() {
    let config_file = config_file("sync:\n  max_depth: deep\n");
    assert!(load_config(config_file.path()).is_err());
}

#[tokio::test]
#[serial]
async fn test_load_config_errors_for_missing_file() {
    let err = load_config("/nonexistent/stats-mirror.yaml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
