//! Configuration tests
//!
//! Execution settings read from a TOML file drive a real run.

use std::fs;

use tempfile::TempDir;

use weft::ExecutionConfig;

use super::helpers::*;

#[test]
fn test_settings_from_config_file_are_applied() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    fs::write(
        &config_path,
        "[execution]\nmax_workers = 1\nfail_fast = true\n",
    )
    .expect("Failed to write config");

    let config = ExecutionConfig::load(&config_path).expect("Failed to load config");
    assert_eq!(config.max_workers, 1);

    let log = new_log();
    let (_tree, failures) = run_single_build(
        config,
        vec![failing_task(":a:fail", &log), recording_task(":b:ok", &log)],
        &[":a:fail", ":b:ok"],
    );

    assert_eq!(failures.len(), 1);
    assert_eq!(recorded(&log), vec![":a:fail"]);
}

#[test]
fn test_invalid_worker_count_is_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "[execution]\nmax_workers = 0\n").expect("Failed to write config");

    let err = ExecutionConfig::load(&config_path).unwrap_err();
    assert!(format!("{err:#}").contains("max_workers"));
}
