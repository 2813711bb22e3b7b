//! Benchmarks for the scheduling hot paths.
//!
//! Benchmarks cover:
//! - Pool set acquisition and release
//! - Stepping iteration tasks
//! - Due-work calculation against the in-memory ledger
//! - Grouping periods into windows

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use flowmaster::core::{DueWork, Interval, IterationTask, ResourcePool, ScheduleSpec, StepResult, SuspensionDirective};
use flowmaster::infra::InMemoryLedger;
use flowmaster::util::SystemClock;
use serde_json::json;

// ============================================================================
// Pools
// ============================================================================

fn bench_pool_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_acquire");
    for set_size in [1usize, 4, 16] {
        let pool = ResourcePool::from_limits((0..set_size).map(|i| (format!("p{i}"), 1_000)));
        let names: Vec<String> = (0..set_size).map(|i| format!("p{i}")).collect();
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(set_size), &names, |b, names| {
            b.iter(|| {
                assert!(pool.try_acquire(black_box(names)).unwrap());
                pool.release(names);
            });
        });
    }
    group.finish();
}

// ============================================================================
// Tasks
// ============================================================================

fn bench_task_steps(c: &mut Criterion) {
    let pool = Arc::new(ResourcePool::from_limits([("db", 4)]));
    c.bench_function("task_100_steps_with_pool_waits", |b| {
        b.iter(|| {
            let mut n = 0u32;
            let mut task = IterationTask::new(
                "bench",
                move || {
                    n += 1;
                    match n {
                        201.. => StepResult::Done,
                        n if n % 2 == 1 => StepResult::Suspend(SuspensionDirective::pools(["db"])),
                        n => StepResult::Value(json!(n)),
                    }
                },
                Arc::clone(&pool),
                Arc::new(SystemClock),
            );
            black_box(task.run_to_completion().unwrap());
        });
    });
}

// ============================================================================
// Due work
// ============================================================================

fn bench_due_entries(c: &mut Criterion) {
    let schedule = ScheduleSpec::new(Interval::Seconds(60), chrono_tz::UTC, "00:00:00", None, 1, false).unwrap();
    let work = DueWork {
        flow: "bench".into(),
        schedule,
        config_hash: "h".into(),
        retries: 3,
        retry_delay: Duration::from_secs(60),
        max_fatal_errors: 3,
        backfill: None,
    };
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();

    c.bench_function("due_entries_1000_ticks", |b| {
        b.iter(|| {
            let ledger = InMemoryLedger::new();
            for minute in 0..1_000 {
                let now = start + ChronoDuration::minutes(minute);
                black_box(work.get_due_entries(&ledger, now).unwrap());
            }
        });
    });

    let periods: Vec<_> = (0..10_000).map(|m| start + ChronoDuration::minutes(m)).collect();
    let grouping = ScheduleSpec::new(Interval::Seconds(60), chrono_tz::UTC, "00:00:30", None, 24, false).unwrap();
    c.bench_function("group_10000_periods", |b| {
        b.iter(|| black_box(grouping.group_periods(periods.clone()).unwrap()));
    });
}

criterion_group!(benches, bench_pool_acquire, bench_task_steps, bench_due_entries);
criterion_main!(benches);
