//! Tests for configuration validation

use flowmaster::config::{ExecutorConfig, PoolsConfig, Settings, DEFAULT_FLOWS_LIMIT, DEFAULT_FLOWS_POOL};

#[test]
fn test_starter_pools_are_valid() {
    let cfg = PoolsConfig::starter();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.limits.get(DEFAULT_FLOWS_POOL), Some(&DEFAULT_FLOWS_LIMIT));
}

#[test]
fn test_pools_reject_zero_limit() {
    let cfg = PoolsConfig::starter().with_pool("db", 0);
    assert!(cfg.validate().unwrap_err().contains("db"));
}

#[test]
fn test_pools_parse_flat_mapping() {
    let cfg = PoolsConfig::from_json_str(r#"{"flows": 10, "api": 2}"#).unwrap();
    assert_eq!(cfg.limits.len(), 2);
    assert_eq!(cfg.limits["api"], 2);
    assert!(PoolsConfig::from_json_str(r#"{"flows": -1}"#).is_err());
}

#[test]
fn test_missing_pools_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PoolsConfig::load(&dir.path().join("pools.json")).unwrap();
    assert!(cfg.limits.is_empty());
}

#[test]
fn test_executor_config_validation() {
    assert!(ExecutorConfig::new().with_workers(2).validate().is_ok());
    assert!(ExecutorConfig::new().with_workers(0).validate().is_err());

    let inverted = ExecutorConfig {
        tick_interval_ms: 500,
        order_interval_ms: 100,
        ..ExecutorConfig::default()
    };
    assert!(inverted.validate().is_err());
}

#[test]
fn test_executor_config_from_json_defaults() {
    let cfg = ExecutorConfig::from_json_str(r#"{"workers": 3, "max_orders": 5}"#).unwrap();
    assert_eq!(cfg.workers, 3);
    assert_eq!(cfg.max_orders, Some(5));
    assert_eq!(cfg.tick_interval_ms, 1_000);
    assert!(!cfg.dry_run);
}

#[test]
fn test_settings_layout_and_init() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::with_home(dir.path().join("home"));
    settings.init_dirs().unwrap();

    assert!(settings.notebooks_dir.is_dir());
    assert!(settings.logs_dir.is_dir());
    assert_eq!(settings.load_pools().unwrap(), PoolsConfig::starter());

    // A second init keeps an edited pools.json.
    std::fs::write(&settings.pools_path, r#"{"flows": 3}"#).unwrap();
    settings.init_dirs().unwrap();
    assert_eq!(settings.load_pools().unwrap().limits["flows"], 3);
}
