//! Tests for builders

use chrono::{TimeZone, Utc};
use flowmaster::builders::{build_pool, EngineBuilder};
use flowmaster::config::{ExecutorConfig, PoolsConfig, Settings};
use flowmaster::core::SchedulerError;
use flowmaster::flow::StaticNotebooks;
use flowmaster::infra::{FlowEntry, FlowStatus, InMemoryLedger, LedgerStore};
use flowmaster::util::ManualClock;
use std::sync::Arc;

fn settings() -> (tempfile::TempDir, Settings) {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::with_home(dir.path());
    settings.init_dirs().unwrap();
    (dir, settings)
}

#[test]
fn test_build_pool_from_config() {
    let pool = build_pool(&PoolsConfig::starter().with_pool("api", 2)).unwrap();
    assert_eq!(pool.usage("api").unwrap().limit, 2);
    assert_eq!(pool.snapshot().len(), 2);
}

#[test]
fn test_build_pool_rejects_invalid_config() {
    let result = build_pool(&PoolsConfig::starter().with_pool("api", 0));
    assert!(matches!(result, Err(SchedulerError::Config(_))));
}

#[test]
fn test_engine_defaults_to_sqlite_ledger() {
    let (_dir, settings) = settings();
    let engine = EngineBuilder::new(settings.clone(), ExecutorConfig::new().with_workers(1))
        .with_notebooks(StaticNotebooks::default())
        .build()
        .unwrap();
    assert!(settings.db_path.exists());
    assert!(engine.pool.usage("flows").is_some());
    assert!(!engine.executor.is_stopped());
}

#[test]
fn test_dry_run_engine_keeps_database_untouched() {
    let (_dir, settings) = settings();
    let executor = ExecutorConfig::new().with_workers(1).with_dry_run(true);
    EngineBuilder::new(settings.clone(), executor)
        .with_notebooks(StaticNotebooks::default())
        .build()
        .unwrap();
    assert!(!settings.db_path.exists());
}

#[test]
fn test_build_recovers_lost_entries() {
    let (_dir, settings) = settings();
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let ledger = Arc::new(InMemoryLedger::new());
    ledger
        .create(&FlowEntry::new("demo", now, FlowStatus::Run, "h", now))
        .unwrap();

    EngineBuilder::new(settings, ExecutorConfig::new().with_workers(1))
        .with_ledger(ledger.clone())
        .with_clock(Arc::new(ManualClock::new(now)))
        .with_notebooks(StaticNotebooks::default())
        .build()
        .unwrap();

    assert_eq!(ledger.get("demo", now).unwrap().unwrap().status, FlowStatus::Add);
}

#[test]
fn test_invalid_executor_config_fails_build() {
    let (_dir, settings) = settings();
    let result = EngineBuilder::new(settings, ExecutorConfig::new().with_workers(0))
        .with_notebooks(StaticNotebooks::default())
        .build();
    assert!(result.is_err());
}
