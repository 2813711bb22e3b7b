//! Ledger contract tests
//!
//! Every scenario runs against both the in-memory and the SQLite backend so
//! the two stay interchangeable.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use flowmaster::infra::{EntryUpdate, EtlStep, FlowEntry, FlowStatus, InMemoryLedger, LedgerStore, PeriodRange, SqliteLedger};
use serde_json::json;
use std::time::Duration;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn hour(n: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::hours(n)
}

fn backends() -> Vec<(&'static str, Box<dyn LedgerStore>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = SqliteLedger::open(dir.path().join("ledger.sqlite")).unwrap();
    vec![
        ("memory", Box::new(InMemoryLedger::new()), None),
        ("sqlite", Box::new(sqlite), Some(dir)),
    ]
}

fn seed(ledger: &dyn LedgerStore, flow: &str, statuses: &[FlowStatus]) {
    for (i, status) in statuses.iter().enumerate() {
        let period = hour(i64::try_from(i).unwrap());
        assert!(ledger.create(&FlowEntry::new(flow, period, *status, "h1", t0())).unwrap());
    }
}

// ============================================================================
// CONTRACT
// ============================================================================

#[test]
fn test_create_is_idempotent_per_period() {
    for (name, ledger, _dir) in backends() {
        let entry = FlowEntry::new("f", t0(), FlowStatus::Add, "h1", t0());
        assert!(ledger.create(&entry).unwrap(), "{name}");
        assert!(!ledger.create(&entry).unwrap(), "{name}");
        assert_eq!(ledger.count("f", &[]).unwrap(), 1, "{name}");
    }
}

#[test]
fn test_first_last_and_list_order() {
    for (name, ledger, _dir) in backends() {
        seed(ledger.as_ref(), "f", &[FlowStatus::Success, FlowStatus::Error, FlowStatus::Add]);
        seed(ledger.as_ref(), "other", &[FlowStatus::Add]);

        assert_eq!(ledger.first_entry("f").unwrap().unwrap().period, hour(0), "{name}");
        assert_eq!(ledger.last_entry("f").unwrap().unwrap().period, hour(2), "{name}");

        let listed: Vec<_> = ledger.list("f", &[], None, 0).unwrap().into_iter().map(|e| e.period).collect();
        assert_eq!(listed, vec![hour(2), hour(1), hour(0)], "{name}");

        let page: Vec<_> = ledger.list("f", &[], Some(1), 1).unwrap().into_iter().map(|e| e.period).collect();
        assert_eq!(page, vec![hour(1)], "{name}");

        assert_eq!(ledger.count("f", &[FlowStatus::Add, FlowStatus::Error]).unwrap(), 2, "{name}");
        assert_eq!(ledger.flows().unwrap(), vec!["f".to_string(), "other".to_string()], "{name}");
    }
}

#[test]
fn test_set_status_respects_filter_and_range() {
    for (name, ledger, _dir) in backends() {
        seed(
            ledger.as_ref(),
            "f",
            &[FlowStatus::Add, FlowStatus::Add, FlowStatus::Success, FlowStatus::Add],
        );
        let range = PeriodRange::between(hour(1), hour(2));
        let changed = ledger
            .set_status("f", FlowStatus::Run, &[FlowStatus::Add], &range, hour(5))
            .unwrap();
        assert_eq!(changed, 1, "{name}");

        let entry = ledger.get("f", hour(1)).unwrap().unwrap();
        assert_eq!(entry.status, FlowStatus::Run, "{name}");
        assert_eq!(entry.updated_at, hour(5), "{name}");
        assert_eq!(ledger.get("f", hour(2)).unwrap().unwrap().status, FlowStatus::Success, "{name}");
        assert_eq!(ledger.get("f", hour(0)).unwrap().unwrap().status, FlowStatus::Add, "{name}");
    }
}

#[test]
fn test_apply_update_writes_every_field() {
    for (name, ledger, _dir) in backends() {
        seed(ledger.as_ref(), "f", &[FlowStatus::Run, FlowStatus::Run]);
        let update = EntryUpdate {
            status: Some(FlowStatus::Success),
            etl_step: Some(Some(EtlStep::Load)),
            info: Some(Some("done".into())),
            duration: Some(42),
            log_path: Some("/tmp/f.log".into()),
            finished_at: Some(hour(3)),
            payload: Some(json!({"number_rows": 7})),
            ..EntryUpdate::default()
        };
        assert_eq!(ledger.apply_update("f", &[hour(0), hour(1)], &update, hour(3)).unwrap(), 2, "{name}");

        let entry = ledger.get("f", hour(1)).unwrap().unwrap();
        assert_eq!(entry.status, FlowStatus::Success, "{name}");
        assert_eq!(entry.etl_step, Some(EtlStep::Load), "{name}");
        assert_eq!(entry.info.as_deref(), Some("done"), "{name}");
        assert_eq!(entry.duration, Some(42), "{name}");
        assert_eq!(entry.payload["number_rows"], json!(7), "{name}");

        let clear = EntryUpdate {
            etl_step: Some(None),
            info: Some(None),
            ..EntryUpdate::default()
        };
        ledger.apply_update("f", &[hour(1)], &clear, hour(4)).unwrap();
        let entry = ledger.get("f", hour(1)).unwrap().unwrap();
        assert_eq!(entry.etl_step, None, "{name}");
        assert_eq!(entry.info, None, "{name}");
        assert_eq!(entry.duration, Some(42), "{name}");
    }
}

#[test]
fn test_recently_updated_orders_by_update_time() {
    for (name, ledger, _dir) in backends() {
        seed(ledger.as_ref(), "f", &[FlowStatus::Add, FlowStatus::Add, FlowStatus::Add]);
        ledger
            .set_status("f", FlowStatus::FatalError, &[], &PeriodRange::between(hour(0), hour(0)), hour(9))
            .unwrap();
        let recent: Vec<_> = ledger
            .recently_updated("f", 2)
            .unwrap()
            .into_iter()
            .map(|e| e.period)
            .collect();
        assert_eq!(recent, vec![hour(0), hour(2)], "{name}");
    }
}

#[test]
fn test_retry_errors_honors_delay_and_budget() {
    for (name, ledger, _dir) in backends() {
        seed(ledger.as_ref(), "f", &[FlowStatus::Error, FlowStatus::Error]);
        let finished = EntryUpdate {
            finished_at: Some(hour(10)),
            ..EntryUpdate::default()
        };
        ledger.apply_update("f", &[hour(0), hour(1)], &finished, hour(10)).unwrap();
        let exhausted = EntryUpdate {
            retries: Some(2),
            ..EntryUpdate::default()
        };
        ledger.apply_update("f", &[hour(1)], &exhausted, hour(10)).unwrap();

        let delay = Duration::from_secs(60);
        let before = hour(10) + ChronoDuration::seconds(59);
        assert!(ledger.retry_errors("f", 2, delay, before).unwrap().is_empty(), "{name}");

        let at = hour(10) + ChronoDuration::seconds(60);
        assert_eq!(ledger.retry_errors("f", 2, delay, at).unwrap(), vec![hour(0)], "{name}");
        let entry = ledger.get("f", hour(0)).unwrap().unwrap();
        assert_eq!((entry.status, entry.retries), (FlowStatus::Add, 1), "{name}");
        assert_eq!(ledger.get("f", hour(1)).unwrap().unwrap().status, FlowStatus::Error, "{name}");
    }
}

#[test]
fn test_unrepresentable_retry_delay_never_retries_finished_rows() {
    for (name, ledger, _dir) in backends() {
        seed(ledger.as_ref(), "f", &[FlowStatus::Error, FlowStatus::Error]);
        let finished = EntryUpdate {
            finished_at: Some(hour(10)),
            ..EntryUpdate::default()
        };
        ledger.apply_update("f", &[hour(0)], &finished, hour(10)).unwrap();

        for delay in [Duration::MAX, Duration::from_secs(u64::MAX / 2)] {
            let retried = ledger.retry_errors("f", 5, delay, hour(11)).unwrap();
            assert!(!retried.contains(&hour(0)), "{name} {delay:?}");
        }
        // Rows that never finished are not held back by the delay.
        assert_eq!(ledger.get("f", hour(1)).unwrap().unwrap().status, FlowStatus::Add, "{name}");
        assert_eq!(ledger.get("f", hour(0)).unwrap().unwrap().status, FlowStatus::Error, "{name}");
    }
}

#[test]
fn test_reset_fatal_only_touches_stale_hashes() {
    for (name, ledger, _dir) in backends() {
        seed(ledger.as_ref(), "f", &[FlowStatus::FatalError, FlowStatus::FatalError]);
        ledger
            .set_expiry("f", Some(hour(20)), &PeriodRange::all(), hour(1))
            .unwrap();
        ledger
            .create(&FlowEntry::new("f", hour(5), FlowStatus::FatalError, "h2", t0()))
            .unwrap();

        assert_eq!(ledger.reset_fatal("f", "h2", hour(6)).unwrap(), 2, "{name}");
        let entry = ledger.get("f", hour(0)).unwrap().unwrap();
        assert_eq!(entry.status, FlowStatus::Add, "{name}");
        assert_eq!(entry.config_hash, "h2", "{name}");
        assert_eq!(entry.expires_at, None, "{name}");
        assert_eq!(ledger.get("f", hour(5)).unwrap().unwrap().status, FlowStatus::FatalError, "{name}");
    }
}

#[test]
fn test_clear_lost_entries_reverts_then_expires() {
    for (name, ledger, _dir) in backends() {
        seed(ledger.as_ref(), "f", &[FlowStatus::Run, FlowStatus::Run, FlowStatus::Add, FlowStatus::Success]);
        ledger
            .set_expiry("f", Some(hour(1)), &PeriodRange::between(hour(1), hour(3)), t0())
            .unwrap();

        let lost = ledger.clear_lost_entries(hour(2)).unwrap();
        assert_eq!((lost.reverted, lost.expired), (2, 2), "{name}");

        assert_eq!(ledger.get("f", hour(0)).unwrap().unwrap().status, FlowStatus::Add, "{name}");
        let expired = ledger.get("f", hour(1)).unwrap().unwrap();
        assert_eq!(expired.status, FlowStatus::Error, "{name}");
        assert_eq!(expired.info.as_deref(), Some("expired"), "{name}");
        assert_eq!(ledger.get("f", hour(2)).unwrap().unwrap().status, FlowStatus::Error, "{name}");
        assert_eq!(ledger.get("f", hour(3)).unwrap().unwrap().status, FlowStatus::Success, "{name}");
    }
}

#[test]
fn test_delete_by_range_and_periods() {
    for (name, ledger, _dir) in backends() {
        seed(ledger.as_ref(), "f", &[FlowStatus::Add; 4]);
        assert_eq!(ledger.delete_periods("f", &[hour(0), hour(9)]).unwrap(), 1, "{name}");
        assert_eq!(ledger.delete("f", &PeriodRange::between(hour(2), hour(3))).unwrap(), 2, "{name}");
        assert_eq!(ledger.count("f", &[]).unwrap(), 1, "{name}");
        assert_eq!(ledger.delete("f", &PeriodRange::all()).unwrap(), 1, "{name}");
        assert!(ledger.flows().unwrap().is_empty(), "{name}");
    }
}

#[test]
fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.sqlite");
    {
        let ledger = SqliteLedger::open(&path).unwrap();
        seed(&ledger, "f", &[FlowStatus::Success]);
    }
    let ledger = SqliteLedger::open(&path).unwrap();
    assert_eq!(ledger.get("f", hour(0)).unwrap().unwrap().status, FlowStatus::Success);
}
