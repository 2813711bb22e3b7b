//! Tests for error types

use flowmaster::core::{LedgerError, SchedulerError, StageError};
use std::time::Duration;

#[test]
fn test_stage_error_display_and_kind() {
    let err = StageError::Failed("timeout".to_string());
    assert_eq!(format!("{}", err), "stage failed: timeout");
    assert!(!err.is_fatal());
    assert_eq!(err.message(), "timeout");

    let fatal = StageError::Fatal("bad credentials".to_string());
    assert_eq!(format!("{}", fatal), "fatal stage error: bad credentials");
    assert!(fatal.is_fatal());
}

#[test]
fn test_unknown_pool_error() {
    let err = SchedulerError::UnknownPool("db".to_string());
    assert_eq!(format!("{}", err), "unknown pool: db");
    assert!(!err.is_deadline());
}

#[test]
fn test_deadline_errors() {
    let err = SchedulerError::SoftTimeLimitExceeded {
        limit: Duration::from_secs(1),
        elapsed: Duration::from_secs(3),
    };
    assert!(err.is_deadline());
    assert_eq!(format!("{}", err), "step took 3s, soft time limit is 1s");
}

#[test]
fn test_stage_error_is_transparent() {
    let err: SchedulerError = StageError::Failed("boom".to_string()).into();
    assert_eq!(format!("{}", err), "stage failed: boom");
}

#[test]
fn test_ledger_error_wraps_sqlite() {
    let err: LedgerError = rusqlite::Error::InvalidQuery.into();
    assert!(matches!(err, LedgerError::Backend(_)));
    let err: SchedulerError = err.into();
    assert!(format!("{}", err).starts_with("ledger backend error"));
}
